//! Synthetic capture generator used by the reader role and by manager demo
//! mode.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;

use phonendo_mesh::MeshError;
use phonendo_protocol::CaptureRecord;

/// A random reading under a fresh uuid key.
pub fn synthetic_record() -> CaptureRecord {
    let mut rng = rand::thread_rng();
    CaptureRecord {
        key: uuid::Uuid::new_v4().to_string(),
        value: json!({
            "bpm": rng.gen_range(55u32..=120),
            "spo2": rng.gen_range(92u32..=100),
            "captured_at": Utc::now().to_rfc3339(),
        }),
    }
}

/// Feed one synthetic record into `sink` every `interval` until the task is
/// aborted.
pub fn spawn_load<F, Fut>(interval: Duration, sink: F) -> JoinHandle<()>
where
    F: Fn(CaptureRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, MeshError>> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!(interval = ?interval, "Starting synthetic load");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let record = synthetic_record();
            let key = record.key.clone();
            match sink(record).await {
                Ok(true) => tracing::debug!(key = %key, "Synthetic capture accepted"),
                Ok(false) => tracing::warn!(key = %key, "Synthetic capture refused"),
                Err(e) => tracing::warn!(key = %key, error = %e, "Synthetic capture failed"),
            }
        }
    })
}
