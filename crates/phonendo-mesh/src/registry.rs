//! Role registry: which peer currently holds each role.
//!
//! Entries are advisory and local to this node. They are created by the
//! discovery negotiator, read on every dispatch and evicted as soon as a
//! liveness probe fails. The next successful handshake re-creates them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use phonendo_network::{PeerId, PeerTransport};
use phonendo_protocol::Role;

/// Shared role → peer map with liveness-checked lookups.
#[derive(Clone)]
pub struct RoleRegistry {
    entries: Arc<RwLock<HashMap<Role, PeerId>>>,
    transport: Arc<dyn PeerTransport>,
}

impl RoleRegistry {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            transport,
        }
    }

    /// Install `peer` as the holder of `role`. Last writer wins.
    ///
    /// Returns the previous holder when a different peer is displaced, which
    /// is also the only case that logs an override warning.
    pub async fn register(&self, role: Role, peer: PeerId) -> Option<PeerId> {
        let previous = self.entries.write().await.insert(role, peer);
        match previous {
            Some(old) if old != peer => {
                tracing::warn!(
                    role = %role,
                    previous = %old,
                    peer = %peer,
                    "{}:{{{}}} has been overridden",
                    role.tag(),
                    old
                );
                Some(old)
            }
            _ => {
                tracing::info!(role = %role, peer = %peer, "Role registered");
                None
            }
        }
    }

    /// Look up the holder of `role` and probe it.
    ///
    /// A failed probe evicts the entry and yields `None`. The entry is only
    /// removed if it still names the probed peer, so a concurrent `register`
    /// of a newer holder survives.
    pub async fn resolve(&self, role: Role) -> Option<PeerId> {
        let peer = self.peek(role).await?;
        match self.transport.ping(peer).await {
            Ok(rtt) => {
                tracing::trace!(role = %role, peer = %peer, rtt = ?rtt, "Role holder alive");
                Some(peer)
            }
            Err(e) => {
                tracing::warn!(
                    role = %role,
                    peer = %peer,
                    error = %e,
                    "Role holder failed liveness probe, evicting"
                );
                self.evict(role, peer).await;
                None
            }
        }
    }

    /// True iff every role in `roles` resolves to a live peer.
    ///
    /// Probes every role even after a failure so that all stale entries are
    /// evicted in one call.
    pub async fn all_configured(&self, roles: &[Role]) -> bool {
        let mut configured = true;
        for role in roles {
            if self.resolve(*role).await.is_none() {
                configured = false;
            }
        }
        configured
    }

    /// Lookup without a liveness probe.
    pub async fn peek(&self, role: Role) -> Option<PeerId> {
        self.entries.read().await.get(&role).copied()
    }

    /// Remove `role` if it is still held by `peer`. Returns whether an entry
    /// was removed.
    pub async fn evict(&self, role: Role, peer: PeerId) -> bool {
        let mut entries = self.entries.write().await;
        if entries.get(&role) == Some(&peer) {
            entries.remove(&role);
            true
        } else {
            false
        }
    }

    /// Current entries, sorted by role, for diagnostics.
    pub async fn snapshot(&self) -> Vec<(Role, PeerId)> {
        let mut entries: Vec<(Role, PeerId)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(role, peer)| (*role, *peer))
            .collect();
        entries.sort_by_key(|(role, _)| *role);
        entries
    }
}
