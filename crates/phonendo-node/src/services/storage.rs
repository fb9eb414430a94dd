//! Storage role: a JSON-file record cache.
//!
//! Every record is kept as key → (value, stage). Captures, verifications and
//! publications only ever move a record forward; a repeated capture of a
//! record that already progressed is acknowledged but changes nothing, which
//! keeps replay idempotent.
//!
//! The whole cache is rewritten on every mutation (write to a sibling temp
//! file, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use phonendo_mesh::{handler, DispatcherBuilder, MeshError};
use phonendo_protocol::{wire, Protocol, Stage};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub value: Value,
    pub stage: Stage,
}

/// Persistent record cache backing the storage role.
#[derive(Clone)]
pub struct RecordCache {
    path: Arc<PathBuf>,
    records: Arc<Mutex<BTreeMap<String, CachedRecord>>>,
}

impl RecordCache {
    /// Open the cache at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        tracing::info!(path = %path.display(), records = records.len(), "Opened record cache");
        Ok(Self {
            path: Arc::new(path),
            records: Arc::new(Mutex::new(records)),
        })
    }

    async fn persist(&self, records: &BTreeMap<String, CachedRecord>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        let io = |source| StorageError::Io {
            path: self.path.to_path_buf(),
            source,
        };
        tokio::fs::write(&tmp, &bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, self.path.as_path()).await.map_err(io)?;
        Ok(())
    }

    /// Record a new capture. Records already past `Captured` are left alone.
    pub async fn capture(&self, key: &str, value: Value) -> Result<bool, StorageError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(key) {
            if existing.stage != Stage::Captured {
                tracing::debug!(key = %key, stage = %existing.stage, "Ignoring repeated capture");
                return Ok(true);
            }
        }
        records.insert(
            key.to_string(),
            CachedRecord {
                value,
                stage: Stage::Captured,
            },
        );
        self.persist(&records).await?;
        tracing::info!(key = %key, "Stored capture");
        Ok(true)
    }

    /// Replace the value with its signed envelope and mark it verified.
    pub async fn verify(&self, key: &str, envelope: Value) -> Result<bool, StorageError> {
        let mut records = self.records.lock().await;
        if records
            .get(key)
            .is_some_and(|r| r.stage == Stage::Published)
        {
            tracing::debug!(key = %key, "Ignoring verification of published record");
            return Ok(true);
        }
        records.insert(
            key.to_string(),
            CachedRecord {
                value: envelope,
                stage: Stage::Verified,
            },
        );
        self.persist(&records).await?;
        tracing::info!(key = %key, "Stored verification");
        Ok(true)
    }

    /// Mark a record published. Unknown keys are refused.
    pub async fn publish(&self, key: &str) -> Result<bool, StorageError> {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(record) => {
                record.stage = Stage::Published;
                self.persist(&records).await?;
                tracing::info!(key = %key, "Marked published");
                Ok(true)
            }
            None => {
                tracing::warn!(key = %key, "Publish for unknown record");
                Ok(false)
            }
        }
    }

    /// Records currently at `stage`, in key order.
    pub async fn items(&self, stage: Stage) -> Vec<(String, Value)> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.stage == stage)
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Every record not yet published.
    pub async fn pending(&self) -> Vec<(String, Value)> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.stage.is_pending())
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<CachedRecord> {
        self.records.lock().await.get(key).cloned()
    }
}

fn encode_list(items: &[(String, Value)]) -> Result<String, MeshError> {
    Ok(wire::encode_items(
        items.iter().map(|(k, v)| (k.as_str(), v)),
    )?)
}

/// Attach the storage operations to a dispatcher.
pub fn routes(builder: DispatcherBuilder, cache: RecordCache) -> DispatcherBuilder {
    let capture = cache.clone();
    let verify = cache.clone();
    let publish = cache.clone();
    let listing = cache.clone();
    let reconnect = cache;

    builder
        .route(
            Protocol::Capture,
            handler(move |call| {
                let cache = capture.clone();
                async move {
                    let (key, value) = wire::decode_keyed(&call.payload)?;
                    let ok = cache.capture(&key, value).await.map_err(MeshError::handler)?;
                    Ok(wire::encode_status(ok).to_string())
                }
            }),
        )
        .route(
            Protocol::Verify,
            handler(move |call| {
                let cache = verify.clone();
                async move {
                    let (key, envelope) = wire::decode_keyed(&call.payload)?;
                    let ok = cache.verify(&key, envelope).await.map_err(MeshError::handler)?;
                    Ok(wire::encode_status(ok).to_string())
                }
            }),
        )
        .route(
            Protocol::Publish,
            handler(move |call| {
                let cache = publish.clone();
                async move {
                    let ok = cache
                        .publish(call.payload.trim())
                        .await
                        .map_err(MeshError::handler)?;
                    Ok(wire::encode_status(ok).to_string())
                }
            }),
        )
        .route(
            Protocol::Cache,
            handler(move |call| {
                let cache = listing.clone();
                async move {
                    let stage: Stage = call.payload.parse()?;
                    let items = cache.items(stage).await;
                    tracing::debug!(stage = %stage, count = items.len(), "Serving cache listing");
                    encode_list(&items)
                }
            }),
        )
        .route(
            Protocol::Reconnect,
            handler(move |_| {
                let cache = reconnect.clone();
                async move { encode_list(&cache.pending().await) }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("phonendo-cache-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_stage_progression_and_listing() {
        let path = temp_path();
        let cache = RecordCache::open(&path).await.unwrap();

        cache.capture("a", json!(1)).await.unwrap();
        cache.capture("b", json!(2)).await.unwrap();
        cache.verify("a", json!({"source": 1, "signature": "00"})).await.unwrap();

        assert_eq!(cache.items(Stage::Captured).await, vec![("b".to_string(), json!(2))]);
        assert_eq!(cache.items(Stage::Verified).await.len(), 1);
        assert_eq!(cache.pending().await.len(), 2);

        assert!(cache.publish("a").await.unwrap());
        assert!(!cache.publish("missing").await.unwrap());
        assert_eq!(cache.pending().await.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_repeated_capture_does_not_regress() {
        let path = temp_path();
        let cache = RecordCache::open(&path).await.unwrap();

        cache.capture("k", json!("raw")).await.unwrap();
        cache.verify("k", json!({"source": "raw", "signature": "ab"})).await.unwrap();
        assert!(cache.capture("k", json!("raw")).await.unwrap());

        assert_eq!(cache.get("k").await.unwrap().stage, Stage::Verified);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let path = temp_path();
        {
            let cache = RecordCache::open(&path).await.unwrap();
            cache.capture("k1", json!({"bpm": 70})).await.unwrap();
        }
        let reopened = RecordCache::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("k1").await,
            Some(CachedRecord {
                value: json!({"bpm": 70}),
                stage: Stage::Captured
            })
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let path = temp_path();
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            RecordCache::open(&path).await,
            Err(StorageError::Corrupt { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }
}
