//! Pipeline orchestrator: capture → verify → publish.
//!
//! Runs on the manager node. Every transition is one request to the role
//! that owns it, gated on that role (and storage) being reachable. A step
//! that cannot run is dropped with a warning; the item stays cached in
//! storage at its current stage and is picked up again by reconnection
//! replay when the missing role shows up.
//!
//! Per item, transitions run strictly in order on a single task.

use std::collections::HashSet;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use phonendo_network::PeerId;
use phonendo_protocol::{
    crypto, wire, CaptureRecord, PendingItem, Protocol, Role, SignatureEnvelope, Stage,
    PK_PAYLOAD, RECONNECT_PAYLOAD,
};

use crate::dispatcher::{handler, Handler, RoleClient};
use crate::events::{EventBus, PipelineEvent};
use crate::negotiator::{hook, NegotiatorBuilder};
use crate::replay::{replay_pass, PassOutcome, ReplayController, ReplayPolicy};
use crate::{MeshError, RoleRegistry};

/// Stages that can still move, in pipeline order.
const PENDING_STAGES: [Stage; 2] = [Stage::Captured, Stage::Verified];

/// A record key together with the verifier that refused to sign it.
type Rejection = (String, PeerId);

/// Verifier public key together with the peer it was fetched from.
#[derive(Debug, Clone, Copy)]
struct CachedKey {
    verifier: PeerId,
    key: VerifyingKey,
}

struct Inner {
    client: RoleClient,
    events: EventBus,
    key_cache: RwLock<Option<CachedKey>>,
    /// Captured records the current verifier already rejected. Replay skips
    /// them until a different verifier holds the role.
    rejected: RwLock<HashSet<Rejection>>,
    replay: Arc<ReplayController>,
}

/// Cheaply cloneable handle to the manager's pipeline.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(client: RoleClient, policy: ReplayPolicy) -> Self {
        let events = EventBus::new();
        let replay = ReplayController::new(policy, events.clone());
        Self {
            inner: Arc::new(Inner {
                client,
                events,
                key_cache: RwLock::new(None),
                rejected: RwLock::new(HashSet::new()),
                replay,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &RoleRegistry {
        self.inner.client.registry()
    }

    pub fn client(&self) -> &RoleClient {
        &self.inner.client
    }

    /// The cached verifier key, if any, and the peer it belongs to.
    pub async fn cached_key(&self) -> Option<(PeerId, VerifyingKey)> {
        self.inner
            .key_cache
            .read()
            .await
            .map(|cached| (cached.verifier, cached.key))
    }

    fn emit(&self, event: PipelineEvent) {
        self.inner.events.emit(event);
    }

    // -----------------------------------------------------------------------
    // Role-connect hooks
    // -----------------------------------------------------------------------

    /// Accept the pipeline roles and attach the orchestrator's hooks.
    pub fn install_hooks(&self, builder: NegotiatorBuilder) -> NegotiatorBuilder {
        let storage = self.clone();
        let verifier = self.clone();
        let publisher = self.clone();
        builder
            .accept(Role::Storage)
            .accept(Role::Verifier)
            .accept(Role::Publisher)
            .on_connect(
                Role::Storage,
                hook(move |peer| {
                    let this = storage.clone();
                    async move { this.on_storage_connected(peer).await }
                }),
            )
            .on_connect(
                Role::Verifier,
                hook(move |peer| {
                    let this = verifier.clone();
                    async move { this.on_verifier_connected(peer).await }
                }),
            )
            .on_connect(
                Role::Publisher,
                hook(move |peer| {
                    let this = publisher.clone();
                    async move { this.on_publisher_connected(peer).await }
                }),
            )
    }

    pub async fn on_storage_connected(&self, peer: PeerId) {
        tracing::info!(peer = %peer, "Storage connected, replaying cached items");
        self.trigger_replay().await;
    }

    pub async fn on_verifier_connected(&self, peer: PeerId) {
        if let Err(e) = self.fetch_key(peer).await {
            tracing::warn!(peer = %peer, error = %e, "Could not fetch verifier public key");
        }
        if self.registry().all_configured(&[Role::Storage]).await {
            self.trigger_replay().await;
        }
    }

    pub async fn on_publisher_connected(&self, peer: PeerId) {
        tracing::info!(peer = %peer, "Publisher connected");
        if self.registry().all_configured(&[Role::Storage]).await {
            self.trigger_replay().await;
        }
    }

    // -----------------------------------------------------------------------
    // Verifier key cache
    // -----------------------------------------------------------------------

    /// Fetch the verifier's SPKI PEM key and cache it against `verifier`.
    pub async fn fetch_key(&self, verifier: PeerId) -> Result<VerifyingKey, MeshError> {
        let pem = self
            .inner
            .client
            .invoke_peer(verifier, Protocol::Pk, PK_PAYLOAD)
            .await?;
        let key = crypto::public_key_from_pem(&pem).map_err(MeshError::malformed)?;
        let fingerprint = crypto::key_fingerprint(&key);

        *self.inner.key_cache.write().await = Some(CachedKey { verifier, key });
        tracing::info!(peer = %verifier, fingerprint = %fingerprint, "Cached verifier public key");
        self.emit(PipelineEvent::KeyCached {
            verifier,
            fingerprint,
        });
        Ok(key)
    }

    /// Key for `verifier`. A key cached for a different peer is stale and
    /// gets replaced.
    async fn verification_key(&self, verifier: PeerId) -> Result<VerifyingKey, MeshError> {
        if let Some(cached) = *self.inner.key_cache.read().await {
            if cached.verifier == verifier {
                return Ok(cached.key);
            }
        }
        tracing::debug!(peer = %verifier, "No key cached for current verifier");
        self.fetch_key(verifier).await
    }

    // -----------------------------------------------------------------------
    // Pipeline operations
    // -----------------------------------------------------------------------

    /// Store a new record and, once storage confirms, forward it towards
    /// verification in the background.
    ///
    /// Returns `false` when storage is unavailable or refuses the record.
    pub async fn capture(&self, record: CaptureRecord) -> Result<bool, MeshError> {
        if !self.registry().all_configured(&[Role::Storage]).await {
            tracing::warn!(key = %record.key, "Storage unavailable, capture dropped");
            self.emit(PipelineEvent::Dropped {
                key: record.key,
                stage: Stage::Captured,
                reason: MeshError::RoleUnavailable(Role::Storage).to_string(),
            });
            return Ok(false);
        }

        let payload = wire::encode_keyed(&record.key, &record.value)?;
        let status = self
            .inner
            .client
            .invoke(Role::Storage, Protocol::Capture, payload)
            .await?;
        if !wire::decode_status(&status) {
            tracing::warn!(key = %record.key, status = %status, "Storage refused capture");
            return Ok(false);
        }

        tracing::info!(key = %record.key, "Captured");
        self.emit(PipelineEvent::Captured {
            key: record.key.clone(),
        });

        let this = self.clone();
        let item = PendingItem::new(record.key, record.value, Stage::Captured);
        tokio::spawn(async move {
            this.advance(item).await;
        });
        Ok(true)
    }

    /// `/capture/1.0.0` handler for the manager: JSON `{key, value}` in,
    /// `true`/`false` out.
    pub fn capture_handler(&self) -> Handler {
        let this = self.clone();
        handler(move |call| {
            let this = this.clone();
            async move {
                let record: CaptureRecord =
                    serde_json::from_str(&call.payload).map_err(MeshError::malformed)?;
                match this.capture(record).await {
                    Ok(ok) => Ok(wire::encode_status(ok).to_string()),
                    Err(e @ MeshError::Protocol(_)) => Err(e),
                    Err(e) => {
                        tracing::warn!(peer = %call.peer, error = %e, "Capture failed");
                        Ok(wire::encode_status(false).to_string())
                    }
                }
            }
        })
    }

    /// Captured → Verified for one record.
    ///
    /// Sends the value to the verifier, checks the returned envelope against
    /// the cached key and records it in storage. Returns the envelope as
    /// stored.
    pub async fn verify(&self, key: &str, value: &Value) -> Result<Value, MeshError> {
        let verifier = self
            .registry()
            .resolve(Role::Verifier)
            .await
            .ok_or(MeshError::RoleUnavailable(Role::Verifier))?;
        let verifying_key = self.verification_key(verifier).await?;

        let message = serde_json::to_string(value).map_err(MeshError::malformed)?;
        let response = self
            .inner
            .client
            .invoke_peer(verifier, Protocol::Verify, message)
            .await?;
        let envelope: SignatureEnvelope =
            serde_json::from_str(&response).map_err(MeshError::malformed)?;

        let check = if envelope.source != *value {
            Err("signed source differs from the submitted record".to_string())
        } else {
            crypto::verify_envelope(&verifying_key, &envelope).map_err(|e| e.to_string())
        };
        if let Err(reason) = check {
            tracing::warn!(key = %key, peer = %verifier, reason = %reason, "Verification rejected");
            self.inner
                .rejected
                .write()
                .await
                .insert((key.to_string(), verifier));
            self.emit(PipelineEvent::VerificationRejected {
                key: key.to_string(),
                verifier,
                reason: reason.clone(),
            });
            return Err(MeshError::VerificationFailed(reason));
        }

        let stored = serde_json::to_value(&envelope).map_err(MeshError::malformed)?;
        let status = self
            .inner
            .client
            .invoke(
                Role::Storage,
                Protocol::Verify,
                wire::encode_keyed(key, &stored)?,
            )
            .await?;
        if !wire::decode_status(&status) {
            return Err(MeshError::Remote(format!(
                "storage refused verified record: {status}"
            )));
        }

        tracing::info!(key = %key, "Verified");
        self.emit(PipelineEvent::Verified {
            key: key.to_string(),
        });
        Ok(stored)
    }

    /// Verified → Published for one record. Returns storage's final status.
    pub async fn publish(&self, key: &str, value: &Value) -> Result<String, MeshError> {
        let message = serde_json::to_string(value).map_err(MeshError::malformed)?;
        let status = self
            .inner
            .client
            .invoke(Role::Publisher, Protocol::Publish, message)
            .await?;
        if !wire::decode_status(&status) {
            return Err(MeshError::Remote(format!("publisher refused record: {status}")));
        }

        let status = self
            .inner
            .client
            .invoke(Role::Storage, Protocol::Publish, key)
            .await?;
        if !wire::decode_status(&status) {
            return Err(MeshError::Remote(format!(
                "storage refused published record: {status}"
            )));
        }

        tracing::info!(key = %key, status = %status, "Published");
        self.emit(PipelineEvent::Published {
            key: key.to_string(),
            status: status.clone(),
        });
        Ok(status)
    }

    /// Move `item` forward as far as the reachable roles allow and return
    /// the stage it ended at.
    pub async fn advance(&self, mut item: PendingItem) -> Stage {
        while let Some(role) = item.stage.next_role() {
            if !self.registry().all_configured(&[role, Role::Storage]).await {
                tracing::warn!(
                    key = %item.key,
                    stage = %item.stage,
                    role = %role,
                    "Next role unavailable, item stays cached"
                );
                self.emit(PipelineEvent::Dropped {
                    key: item.key,
                    stage: item.stage,
                    reason: MeshError::RoleUnavailable(role).to_string(),
                });
                return item.stage;
            }

            let result = match item.stage {
                Stage::Captured => self
                    .verify(&item.key, &item.value)
                    .await
                    .map(|envelope| PendingItem::new(item.key.clone(), envelope, Stage::Verified)),
                Stage::Verified => self
                    .publish(&item.key, &item.value)
                    .await
                    .map(|_| PendingItem::new(item.key.clone(), item.value.clone(), Stage::Published)),
                Stage::Published => break,
            };

            match result {
                Ok(next) => item = next,
                Err(e) => {
                    tracing::warn!(key = %item.key, stage = %item.stage, error = %e, "Pipeline step failed");
                    self.emit(PipelineEvent::Dropped {
                        key: item.key,
                        stage: item.stage,
                        reason: e.to_string(),
                    });
                    return item.stage;
                }
            }
        }
        item.stage
    }

    // -----------------------------------------------------------------------
    // Reconnection replay
    // -----------------------------------------------------------------------

    /// Start (or wake) the replay loop. Returns whether a new loop started.
    pub async fn trigger_replay(&self) -> bool {
        let this = self.clone();
        let pass = replay_pass(move || {
            let this = this.clone();
            async move { this.replay_once().await }
        });
        self.inner.replay.trigger(pass).await
    }

    /// Everything storage still holds below `Published`.
    ///
    /// The pending set comes from storage's `reconnect` operation. Only a
    /// non-empty set costs a second request: the `verified` cache listing,
    /// which labels each item with its stage.
    pub async fn pending_items(&self) -> Result<Vec<PendingItem>, MeshError> {
        let reply = self
            .inner
            .client
            .invoke(Role::Storage, Protocol::Reconnect, RECONNECT_PAYLOAD)
            .await?;
        let pending = wire::decode_items(&reply).map_err(MeshError::malformed)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let reply = self
            .inner
            .client
            .invoke(Role::Storage, Protocol::Cache, Stage::Verified.as_str())
            .await?;
        let verified: HashSet<String> = wire::decode_items(&reply)
            .map_err(MeshError::malformed)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        Ok(pending
            .into_iter()
            .map(|(key, value)| {
                let stage = if verified.contains(&key) {
                    Stage::Verified
                } else {
                    Stage::Captured
                };
                PendingItem::new(key, value, stage)
            })
            .collect())
    }

    /// Drop captured items the current verifier has already refused.
    async fn without_rejected(&self, batch: Vec<PendingItem>) -> Vec<PendingItem> {
        let Some(verifier) = self.registry().peek(Role::Verifier).await else {
            return batch;
        };
        let rejected = self.inner.rejected.read().await;
        batch
            .into_iter()
            .filter(|item| {
                let skip = rejected.contains(&(item.key.clone(), verifier));
                if skip {
                    tracing::debug!(
                        key = %item.key,
                        peer = %verifier,
                        "Skipping record the verifier rejected"
                    );
                }
                !skip
            })
            .collect()
    }

    /// One replay pass over the pending set.
    async fn replay_once(&self) -> PassOutcome {
        let items = match self.pending_items().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read pending items from storage");
                return PassOutcome::Deferred { deferred: 0 };
            }
        };
        if items.is_empty() {
            tracing::info!("No cached items to replay");
            return PassOutcome::Complete { replayed: 0 };
        }

        let mut replayed = 0;
        let mut deferred = 0;
        for stage in PENDING_STAGES {
            let batch: Vec<PendingItem> = items
                .iter()
                .filter(|item| item.stage == stage)
                .cloned()
                .collect();
            let Some(role) = stage.next_role() else {
                continue;
            };
            if batch.is_empty() {
                continue;
            }

            if !self.registry().all_configured(&[role]).await {
                tracing::warn!(
                    stage = %stage,
                    role = %role,
                    count = batch.len(),
                    "Next role unavailable, deferring cached items"
                );
                deferred += batch.len();
                continue;
            }

            let batch = if stage == Stage::Captured {
                self.without_rejected(batch).await
            } else {
                batch
            };
            if batch.is_empty() {
                continue;
            }

            tracing::info!(stage = %stage, count = batch.len(), "Replaying cached items");
            for item in batch {
                self.advance(item).await;
                replayed += 1;
            }
        }

        if deferred > 0 {
            PassOutcome::Deferred { deferred }
        } else {
            PassOutcome::Complete { replayed }
        }
    }
}
