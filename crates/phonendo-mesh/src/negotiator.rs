//! Discovery negotiation: turn "a peer appeared" into "role R is held by P".
//!
//! Each peer goes through `Unseen → Handshaking → {Resolved, Rejected}` at
//! most once per process. The handshake is a single `/discover/1.0.0`
//! request whose reply is the remote's role tag. Peers that do not speak the
//! protocol, answer garbage or claim a role this node does not track are
//! rejected for good.
//!
//! A resolved peer whose registry entry was later evicted is handshaken
//! again when the transport reports it back, and its hook fires again.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;

use phonendo_network::PeerId;
use phonendo_protocol::{Protocol, Role, DISCOVER_PAYLOAD};

use crate::{MeshError, RoleClient, RoleRegistry};

/// Callback fired when a role is (re)acquired.
pub type RoleHook = Arc<dyn Fn(PeerId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into a [`RoleHook`].
pub fn hook<F, Fut>(f: F) -> RoleHook
where
    F: Fn(PeerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer| f(peer).boxed())
}

/// Handshake state of one peer. Unseen peers have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Resolved(Role),
    Rejected,
}

/// Collects accepted roles and their hooks.
#[derive(Default)]
pub struct NegotiatorBuilder {
    accepted: HashSet<Role>,
    hooks: HashMap<Role, RoleHook>,
    errors: Vec<String>,
}

impl NegotiatorBuilder {
    /// Track `role` without a hook.
    pub fn accept(mut self, role: Role) -> Self {
        self.accepted.insert(role);
        self
    }

    /// Run `hook` every time `role` is acquired. The role must also be
    /// accepted.
    pub fn on_connect(mut self, role: Role, hook: RoleHook) -> Self {
        if self.hooks.insert(role, hook).is_some() {
            self.errors.push(format!("duplicate connect hook for {role}"));
        }
        self
    }

    pub fn build(
        self,
        registry: RoleRegistry,
        client: RoleClient,
    ) -> Result<DiscoveryNegotiator, MeshError> {
        if !self.errors.is_empty() {
            return Err(MeshError::Config(self.errors.join("; ")));
        }
        if let Some(role) = self.hooks.keys().find(|r| !self.accepted.contains(*r)) {
            return Err(MeshError::Config(format!(
                "connect hook for {role} which is not an accepted role"
            )));
        }
        Ok(DiscoveryNegotiator {
            accepted: self.accepted,
            hooks: self.hooks,
            peers: Arc::new(Mutex::new(HashMap::new())),
            registry,
            client,
        })
    }
}

/// Runs the discover handshake and installs roles into the registry.
#[derive(Clone)]
pub struct DiscoveryNegotiator {
    accepted: HashSet<Role>,
    hooks: HashMap<Role, RoleHook>,
    peers: Arc<Mutex<HashMap<PeerId, PeerState>>>,
    registry: RoleRegistry,
    client: RoleClient,
}

impl DiscoveryNegotiator {
    pub fn builder() -> NegotiatorBuilder {
        NegotiatorBuilder::default()
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub async fn state(&self, peer: &PeerId) -> Option<PeerState> {
        self.peers.lock().await.get(peer).copied()
    }

    /// React to any sign of life from `peer` (discovery or a new connection).
    ///
    /// Unseen peers are handshaken. Resolved peers whose role is no longer
    /// held by anyone are re-acquired. Everything else is a no-op.
    pub async fn observe(&self, peer: PeerId) -> Option<PeerState> {
        match self.state(&peer).await {
            None => Some(self.on_discovered(peer).await),
            Some(PeerState::Resolved(role)) => {
                self.reacquire(peer, role).await;
                self.state(&peer).await
            }
            other => other,
        }
    }

    /// Handshake with a newly discovered peer. Returns the resulting state;
    /// a peer already seen is not handshaken twice.
    pub async fn on_discovered(&self, peer: PeerId) -> PeerState {
        {
            let mut peers = self.peers.lock().await;
            if let Some(state) = peers.get(&peer) {
                return *state;
            }
            peers.insert(peer, PeerState::Handshaking);
        }

        let state = self.handshake(peer).await;
        self.peers.lock().await.insert(peer, state);

        if let PeerState::Resolved(role) = state {
            self.acquire(role, peer).await;
        }
        state
    }

    /// Re-run the handshake for a resolved peer whose role entry has been
    /// evicted. Returns whether the role was re-acquired.
    async fn reacquire(&self, peer: PeerId, role: Role) -> bool {
        if self.registry.peek(role).await.is_some() {
            return false;
        }
        {
            let mut peers = self.peers.lock().await;
            // Another task may already be re-handshaking this peer.
            if peers.get(&peer) != Some(&PeerState::Resolved(role)) {
                return false;
            }
            peers.insert(peer, PeerState::Handshaking);
        }

        tracing::info!(peer = %peer, role = %role, "Peer is back, re-acquiring role");
        let state = self.handshake(peer).await;
        self.peers.lock().await.insert(peer, state);

        match state {
            PeerState::Resolved(role) => {
                self.acquire(role, peer).await;
                true
            }
            _ => false,
        }
    }

    async fn handshake(&self, peer: PeerId) -> PeerState {
        let reply = match self
            .client
            .invoke_peer(peer, Protocol::Discover, DISCOVER_PAYLOAD)
            .await
        {
            Ok(reply) => reply,
            Err(MeshError::ProtocolUnsupported { .. }) => {
                tracing::debug!(peer = %peer, "Peer does not speak discover, ignoring");
                return PeerState::Rejected;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Discover handshake failed");
                return PeerState::Rejected;
            }
        };

        match Role::from_tag(reply.trim()) {
            Ok(role) if self.accepted.contains(&role) => PeerState::Resolved(role),
            Ok(role) => {
                tracing::debug!(peer = %peer, role = %role, "Ignoring peer with untracked role");
                PeerState::Rejected
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Peer announced an unknown role");
                PeerState::Rejected
            }
        }
    }

    async fn acquire(&self, role: Role, peer: PeerId) {
        self.registry.register(role, peer).await;
        tracing::info!(peer = %peer, role = %role, "Role acquired");
        if let Some(hook) = self.hooks.get(&role) {
            hook(peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use phonendo_network::{MemoryNetwork, NetworkEvent, PeerTransport};
    use tokio::sync::mpsc;

    use crate::{identify_handler, Dispatcher};

    /// Serve a node's inbound requests with a dispatcher until its channel closes.
    fn serve(dispatcher: Dispatcher, mut events: mpsc::Receiver<NetworkEvent>) {
        let dispatcher = Arc::new(dispatcher);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let NetworkEvent::InboundRequest(request) = event {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move { dispatcher.dispatch(request).await });
                }
            }
        });
    }

    async fn remote(network: &MemoryNetwork, role: Role) -> PeerId {
        let (transport, events) = network.join(&[Protocol::Discover]).await;
        let dispatcher = Dispatcher::builder()
            .route(Protocol::Discover, identify_handler(role))
            .build()
            .unwrap();
        serve(dispatcher, events);
        transport.local_peer_id()
    }

    async fn local(network: &MemoryNetwork) -> (RoleRegistry, RoleClient) {
        let (transport, _events) = network.join(&[]).await;
        let transport: Arc<dyn PeerTransport> = Arc::new(transport);
        let registry = RoleRegistry::new(transport.clone());
        let client = RoleClient::new(registry.clone(), transport);
        (registry, client)
    }

    fn counting_hook(counter: Arc<AtomicUsize>) -> RoleHook {
        hook(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_handshake_registers_and_fires_hook_once() {
        let network = MemoryNetwork::new();
        let storage = remote(&network, Role::Storage).await;
        let (registry, client) = local(&network).await;
        let fired = Arc::new(AtomicUsize::new(0));

        let negotiator = DiscoveryNegotiator::builder()
            .accept(Role::Storage)
            .on_connect(Role::Storage, counting_hook(fired.clone()))
            .build(registry.clone(), client)
            .unwrap();

        assert_eq!(
            negotiator.on_discovered(storage).await,
            PeerState::Resolved(Role::Storage)
        );
        assert_eq!(
            negotiator.on_discovered(storage).await,
            PeerState::Resolved(Role::Storage)
        );
        assert_eq!(registry.peek(Role::Storage).await, Some(storage));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(network.requests_to(storage, Protocol::Discover).await, 1);
    }

    #[tokio::test]
    async fn test_peer_without_discover_is_rejected_for_good() {
        let network = MemoryNetwork::new();
        let (mute, _events) = network.join(&[]).await;
        let (registry, client) = local(&network).await;
        let negotiator = DiscoveryNegotiator::builder()
            .accept(Role::Storage)
            .build(registry, client)
            .unwrap();

        let peer = mute.local_peer_id();
        assert_eq!(negotiator.on_discovered(peer).await, PeerState::Rejected);
        assert_eq!(negotiator.observe(peer).await, Some(PeerState::Rejected));
        assert_eq!(network.requests_to(peer, Protocol::Discover).await, 1);
    }

    #[tokio::test]
    async fn test_untracked_role_is_not_installed() {
        let network = MemoryNetwork::new();
        let reader = remote(&network, Role::Reader).await;
        let (registry, client) = local(&network).await;
        let negotiator = DiscoveryNegotiator::builder()
            .accept(Role::Storage)
            .build(registry.clone(), client)
            .unwrap();

        assert_eq!(negotiator.on_discovered(reader).await, PeerState::Rejected);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_reacquire_after_eviction_fires_hook_again() {
        let network = MemoryNetwork::new();
        let verifier = remote(&network, Role::Verifier).await;
        let (registry, client) = local(&network).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let negotiator = DiscoveryNegotiator::builder()
            .accept(Role::Verifier)
            .on_connect(Role::Verifier, counting_hook(fired.clone()))
            .build(registry.clone(), client)
            .unwrap();

        negotiator.on_discovered(verifier).await;
        network.set_online(verifier, false).await;
        assert_eq!(registry.resolve(Role::Verifier).await, None);

        network.set_online(verifier, true).await;
        negotiator.observe(verifier).await;
        assert_eq!(registry.peek(Role::Verifier).await, Some(verifier));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // Entry is present again, so a further sighting is a no-op.
        negotiator.observe(verifier).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(network.requests_to(verifier, Protocol::Discover).await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_hook_is_config_error() {
        let network = MemoryNetwork::new();
        let (registry, client) = local(&network).await;
        let noop = hook(|_| async {});

        let result = DiscoveryNegotiator::builder()
            .accept(Role::Storage)
            .on_connect(Role::Storage, noop.clone())
            .on_connect(Role::Storage, noop)
            .build(registry, client);
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_hook_for_unaccepted_role_is_config_error() {
        let network = MemoryNetwork::new();
        let (registry, client) = local(&network).await;

        let result = DiscoveryNegotiator::builder()
            .accept(Role::Storage)
            .on_connect(Role::Publisher, hook(|_| async {}))
            .build(registry, client);
        assert!(matches!(result, Err(MeshError::Config(_))));
    }
}
