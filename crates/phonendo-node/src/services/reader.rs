//! Reader role: produces captures and sends them to the manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use phonendo_mesh::{hook, MeshError, NegotiatorBuilder, RoleClient};
use phonendo_protocol::{wire, CaptureRecord, Protocol, Role};

use super::load;

#[derive(Clone)]
pub struct ReaderService {
    client: RoleClient,
    interval: Duration,
    load_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ReaderService {
    pub fn new(client: RoleClient, interval: Duration) -> Self {
        Self {
            client,
            interval,
            load_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Send one record to the current manager.
    pub async fn submit(&self, record: CaptureRecord) -> Result<bool, MeshError> {
        let payload = serde_json::to_string(&record).map_err(MeshError::malformed)?;
        let status = self
            .client
            .invoke(Role::Manager, Protocol::Capture, payload)
            .await?;
        Ok(wire::decode_status(&status))
    }

    /// Track the manager; the generator starts the first time one is found.
    pub fn negotiator(&self, builder: NegotiatorBuilder) -> NegotiatorBuilder {
        let this = self.clone();
        builder.accept(Role::Manager).on_connect(
            Role::Manager,
            hook(move |peer| {
                let this = this.clone();
                async move {
                    tracing::info!(peer = %peer, "Manager connected");
                    this.start().await;
                }
            }),
        )
    }

    pub async fn start(&self) {
        let mut slot = self.load_task.lock().await;
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(load::spawn_load(self.interval, move |record| {
            let this = this.clone();
            async move { this.submit(record).await }
        }));
    }

    pub async fn running(&self) -> bool {
        self.load_task.lock().await.is_some()
    }
}
