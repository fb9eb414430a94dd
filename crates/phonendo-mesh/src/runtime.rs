//! Event loop tying a transport's event stream to the mesh components.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use phonendo_network::NetworkEvent;

use crate::{DiscoveryNegotiator, Dispatcher};

/// Routes transport events: peer sightings to the negotiator, inbound
/// requests to the dispatcher. Each is handled on its own task so a slow
/// handshake or handler never stalls the stream.
pub struct MeshRuntime {
    negotiator: DiscoveryNegotiator,
    dispatcher: Arc<Dispatcher>,
}

impl MeshRuntime {
    pub fn new(negotiator: DiscoveryNegotiator, dispatcher: Dispatcher) -> Self {
        Self {
            negotiator,
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Consume events until the transport closes its channel.
    pub async fn run(self, mut events: mpsc::Receiver<NetworkEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        tracing::info!("Network event stream closed, mesh runtime stopping");
    }

    pub fn spawn(self, events: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerDiscovered(peer) | NetworkEvent::PeerConnected(peer) => {
                let negotiator = self.negotiator.clone();
                tokio::spawn(async move {
                    negotiator.observe(peer).await;
                });
            }
            NetworkEvent::InboundRequest(request) => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(request).await;
                });
            }
            NetworkEvent::PeerDisconnected(peer) => {
                tracing::debug!(peer = %peer, "Peer disconnected");
            }
            NetworkEvent::PeerIdentified {
                peer,
                agent_version,
                ..
            } => {
                tracing::debug!(peer = %peer, agent = %agent_version, "Peer identified");
            }
            NetworkEvent::PingRtt { peer, rtt } => {
                tracing::trace!(peer = %peer, rtt = ?rtt, "Ping");
            }
            NetworkEvent::Listening(addr) => {
                tracing::debug!(addr = %addr, "Transport listening");
            }
        }
    }
}
