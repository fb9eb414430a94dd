//! Publisher role: appends verified records to a timestamped ledger.
//!
//! The ledger stands in for the external publishing sink; it lives in memory
//! for the lifetime of the process.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use phonendo_mesh::{handler, DispatcherBuilder, MeshError};
use phonendo_protocol::{wire, Protocol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub published_at: DateTime<Utc>,
    pub record: Value,
}

#[derive(Clone, Default)]
pub struct Ledger {
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, record: Value) -> LedgerEntry {
        let entry = LedgerEntry {
            published_at: Utc::now(),
            record,
        };
        self.entries.write().await.push(entry.clone());
        entry
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Attach `publish` to a dispatcher.
pub fn routes(builder: DispatcherBuilder, ledger: Ledger) -> DispatcherBuilder {
    builder.route(
        Protocol::Publish,
        handler(move |call| {
            let ledger = ledger.clone();
            async move {
                let record: Value =
                    serde_json::from_str(&call.payload).map_err(MeshError::malformed)?;
                let entry = ledger.append(record).await;
                tracing::info!(
                    peer = %call.peer,
                    published_at = %entry.published_at.to_rfc3339(),
                    "Published record"
                );
                Ok(wire::encode_status(true).to_string())
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_keeps_order() {
        let ledger = Ledger::new();
        assert!(ledger.is_empty().await);

        let first = ledger.append(json!({"n": 1})).await;
        ledger.append(json!({"n": 2})).await;

        let entries = ledger.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert!(entries[0].published_at <= entries[1].published_at);
    }
}
