//! In-process transport implementing the same contract as the libp2p host.
//!
//! A `MemoryNetwork` is a shared switchboard: every joined node gets a
//! `MemoryTransport` plus the same `NetworkEvent` stream a `SwarmHost` would
//! produce. Discovery is explicit (`announce`), peers can be taken offline to
//! simulate outages, and every outbound request is recorded so callers can
//! assert on which operations were (or were not) attempted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::{mpsc, RwLock};

use phonendo_protocol::{Protocol, MAX_PAYLOAD_BYTES};

use crate::exchange::{InboundRequest, PeerTransport};
use crate::swarm_host::NetworkEvent;
use crate::NetworkError;

/// An outbound request observed on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub from: PeerId,
    pub to: PeerId,
    pub protocol: Protocol,
}

struct MemoryPeer {
    protocols: HashSet<Protocol>,
    events: mpsc::Sender<NetworkEvent>,
    online: bool,
}

#[derive(Default)]
struct Switchboard {
    peers: HashMap<PeerId, MemoryPeer>,
    requests: Vec<RequestRecord>,
}

/// Shared in-memory network. Cloning yields another handle to the same one.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node answering `protocols`.
    pub async fn join(
        &self,
        protocols: &[Protocol],
    ) -> (MemoryTransport, mpsc::Receiver<NetworkEvent>) {
        let peer_id = PeerId::random();
        let (events, rx) = mpsc::channel(256);
        self.inner.write().await.peers.insert(
            peer_id,
            MemoryPeer {
                protocols: protocols.iter().copied().collect(),
                events,
                online: true,
            },
        );
        tracing::debug!(peer = %peer_id, "Joined memory network");
        let transport = MemoryTransport {
            network: self.clone(),
            local_peer_id: peer_id,
        };
        (transport, rx)
    }

    /// Make `peer` and every other online node discover each other, the way
    /// an mDNS response round would.
    pub async fn announce(&self, peer: PeerId) {
        let others: Vec<PeerId> = {
            let inner = self.inner.read().await;
            inner
                .peers
                .iter()
                .filter(|(id, p)| **id != peer && p.online)
                .map(|(id, _)| *id)
                .collect()
        };
        for other in others {
            self.discover(other, peer).await;
            self.discover(peer, other).await;
        }
    }

    /// Deliver a single `PeerDiscovered(peer)` event to `observer`.
    pub async fn discover(&self, observer: PeerId, peer: PeerId) {
        self.deliver(observer, NetworkEvent::PeerDiscovered(peer)).await;
    }

    /// Deliver a `PeerConnected(peer)` event to `observer`.
    pub async fn connect(&self, observer: PeerId, peer: PeerId) {
        self.deliver(observer, NetworkEvent::PeerConnected(peer)).await;
    }

    async fn deliver(&self, observer: PeerId, event: NetworkEvent) {
        let sender = {
            let inner = self.inner.read().await;
            inner.peers.get(&observer).map(|p| p.events.clone())
        };
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Take a node offline (requests and probes to it fail) or bring it back.
    pub async fn set_online(&self, peer: PeerId, online: bool) {
        if let Some(p) = self.inner.write().await.peers.get_mut(&peer) {
            p.online = online;
        }
    }

    /// Every request attempted so far, in order.
    pub async fn requests(&self) -> Vec<RequestRecord> {
        self.inner.read().await.requests.clone()
    }

    /// Requests attempted towards `peer` on `protocol`.
    pub async fn requests_to(&self, peer: PeerId, protocol: Protocol) -> usize {
        self.inner
            .read()
            .await
            .requests
            .iter()
            .filter(|r| r.to == peer && r.protocol == protocol)
            .count()
    }

    async fn route(
        &self,
        from: PeerId,
        to: PeerId,
        protocol: Protocol,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkError> {
        let sender = {
            let mut inner = self.inner.write().await;
            inner.requests.push(RequestRecord { from, to, protocol });
            if !inner.peers.get(&from).is_some_and(|p| p.online) {
                return Err(NetworkError::DialError("local node is offline".into()));
            }
            let target = inner
                .peers
                .get(&to)
                .filter(|p| p.online)
                .ok_or_else(|| NetworkError::DialError(format!("peer {to} unreachable")))?;
            if !target.protocols.contains(&protocol) {
                return Err(NetworkError::ProtocolUnsupported(protocol.name().to_string()));
            }
            target.events.clone()
        };

        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetworkError::PayloadTooLarge(payload.len()));
        }

        let (request, reply) = InboundRequest::new(from, protocol, payload);
        sender
            .send(NetworkEvent::InboundRequest(request))
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        reply.await.map_err(|_| NetworkError::ChannelClosed)
    }

    async fn is_reachable(&self, from: PeerId, to: PeerId) -> bool {
        let inner = self.inner.read().await;
        let online = |id: &PeerId| inner.peers.get(id).is_some_and(|p| p.online);
        online(&from) && online(&to)
    }
}

/// One node's view of a `MemoryNetwork`.
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_peer_id: PeerId,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request(
        &self,
        peer: PeerId,
        protocol: Protocol,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkError> {
        self.network
            .route(self.local_peer_id, peer, protocol, payload)
            .await
    }

    async fn ping(&self, peer: PeerId) -> Result<Duration, NetworkError> {
        if self.network.is_reachable(self.local_peer_id, peer).await {
            Ok(Duration::from_micros(50))
        } else {
            Err(NetworkError::DialError(format!("peer {peer} unreachable")))
        }
    }
}
