//! Main SwarmHost that owns the libp2p Swarm and the handle the mesh uses.
//!
//! Architecture:
//! - `SwarmHost` owns the libp2p `Swarm` and runs the event loop in a tokio task.
//! - `SwarmHandle` is a cheaply cloneable handle. Swarm-level commands (dial,
//!   peer listing, shutdown) go over a bounded MPSC channel; stream exchanges
//!   and probes go straight through a `libp2p_stream::Control` clone and never
//!   block the event loop.
//! - Inbound streams for every served protocol are read on their own task and
//!   surfaced as `NetworkEvent::InboundRequest` carrying a reply channel.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p_stream::{Control, IncomingStreams, OpenStreamError};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, mdns, ping, Multiaddr, PeerId, StreamProtocol, Swarm};
use tokio::sync::{mpsc, oneshot};

use phonendo_protocol::Protocol;

use crate::behaviour::{SwarmBehaviour, SwarmBehaviourEvent};
use crate::discovery::{DiscoveryConfig, DiscoveryManager};
use crate::exchange::{self, InboundRequest, PeerTransport};
use crate::transport::{self, TransportConfig};
use crate::NetworkError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the SwarmHost.
#[derive(Debug, Clone)]
pub struct SwarmHostConfig {
    /// Address to listen on (e.g. "/ip4/127.0.0.1/tcp/0").
    pub listen_addr: Multiaddr,
    /// Transport configuration.
    pub transport: TransportConfig,
    /// Discovery configuration.
    pub discovery: DiscoveryConfig,
    /// Protocols this node answers. Every other protocol is refused during
    /// negotiation, which callers observe as `ProtocolUnsupported`.
    pub protocols: Vec<Protocol>,
    /// Command channel buffer size.
    pub command_buffer: usize,
    /// Event channel buffer size.
    pub event_buffer: usize,
    /// How long an inbound stream waits for the handler's reply.
    pub inbound_timeout: Duration,
    /// How long a liveness probe may take before the peer counts as down.
    pub probe_timeout: Duration,
}

impl Default for SwarmHostConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/0"
                .parse()
                .expect("valid default listen addr"),
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
            protocols: vec![Protocol::Discover],
            command_buffer: 256,
            event_buffer: 256,
            inbound_timeout: Duration::from_secs(phonendo_protocol::DEFAULT_REQUEST_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Events emitted to upper layers
// ---------------------------------------------------------------------------

/// Events from the network layer forwarded to the mesh.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A peer became visible through local discovery.
    PeerDiscovered(PeerId),
    /// A connection to a peer was established (either direction).
    PeerConnected(PeerId),
    /// The last connection to a peer closed.
    PeerDisconnected(PeerId),
    /// A peer was identified via the Identify protocol.
    PeerIdentified {
        peer: PeerId,
        agent_version: String,
        listen_addrs: Vec<Multiaddr>,
    },
    /// Ping round-trip time measured.
    PingRtt { peer: PeerId, rtt: Duration },
    /// Swarm is now listening on an address.
    Listening(Multiaddr),
    /// A complete request arrived on a served protocol.
    InboundRequest(InboundRequest),
}

// ---------------------------------------------------------------------------
// Commands from upper layers to the swarm
// ---------------------------------------------------------------------------

enum SwarmCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// SwarmHandle (clonable, Send-able API for upper layers)
// ---------------------------------------------------------------------------

/// A cheaply cloneable handle onto a running SwarmHost.
#[derive(Clone)]
pub struct SwarmHandle {
    command_tx: mpsc::Sender<SwarmCommand>,
    control: Control,
    local_peer_id: PeerId,
    probe_timeout: Duration,
}

impl SwarmHandle {
    /// Dial a remote peer by multiaddress.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SwarmCommand::Dial { addr, reply: tx })
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Stop the event loop. Resolves once the swarm has been dropped.
    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SwarmCommand::Shutdown { reply: tx })
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }
}

#[async_trait]
impl PeerTransport for SwarmHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request(
        &self,
        peer: PeerId,
        protocol: Protocol,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkError> {
        let mut control = self.control.clone();
        let mut stream = control
            .open_stream(peer, StreamProtocol::new(protocol.name()))
            .await
            .map_err(open_stream_error)?;
        exchange::exchange(&mut stream, &payload).await
    }

    async fn ping(&self, peer: PeerId) -> Result<Duration, NetworkError> {
        let mut control = self.control.clone();
        let probe = async move {
            let mut stream = control
                .open_stream(peer, ping::PROTOCOL_NAME)
                .await
                .map_err(open_stream_error)?;
            exchange::probe(&mut stream).await
        };
        tokio::time::timeout(self.probe_timeout, probe)
            .await
            .map_err(|_| NetworkError::Timeout(self.probe_timeout))?
    }
}

fn open_stream_error(err: OpenStreamError) -> NetworkError {
    match err {
        OpenStreamError::UnsupportedProtocol(protocol) => {
            NetworkError::ProtocolUnsupported(protocol.to_string())
        }
        OpenStreamError::Io(e) => NetworkError::Io(e),
        other => NetworkError::Stream(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// SwarmHost (owns the Swarm, runs the event loop)
// ---------------------------------------------------------------------------

/// The network host that owns and drives the libp2p Swarm.
///
/// Created via `SwarmHost::new()`, which also returns a `SwarmHandle` and the
/// event receiver. Call `run()` (typically on a spawned task) to start it.
pub struct SwarmHost {
    swarm: Swarm<SwarmBehaviour>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: mpsc::Sender<NetworkEvent>,
    discovery_manager: DiscoveryManager,
    incoming: Vec<(Protocol, IncomingStreams)>,
    inbound_timeout: Duration,
}

impl SwarmHost {
    /// Create a new SwarmHost and its associated handle.
    pub fn new(
        config: SwarmHostConfig,
    ) -> Result<(Self, SwarmHandle, mpsc::Receiver<NetworkEvent>), NetworkError> {
        let mut transport_config = config.transport;
        transport_config.behaviour_config.mdns_enabled = config.discovery.mdns_enabled;
        let mut swarm = transport::build_swarm(None, transport_config)?;

        swarm
            .listen_on(config.listen_addr.clone())
            .map_err(|e| NetworkError::ListenError(e.to_string()))?;

        let local_peer_id = *swarm.local_peer_id();
        tracing::info!(peer_id = %local_peer_id, "Local peer ID");

        let mut control = swarm.behaviour().stream.new_control();
        let mut incoming = Vec::with_capacity(config.protocols.len());
        for protocol in &config.protocols {
            let streams = control
                .accept(StreamProtocol::new(protocol.name()))
                .map_err(|e| NetworkError::Behaviour(format!("{protocol}: {e}")))?;
            incoming.push((*protocol, streams));
        }

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

        let host = Self {
            swarm,
            command_rx,
            event_tx,
            discovery_manager: DiscoveryManager::new(config.discovery),
            incoming,
            inbound_timeout: config.inbound_timeout,
        };

        let handle = SwarmHandle {
            command_tx,
            control,
            local_peer_id,
            probe_timeout: config.probe_timeout,
        };

        Ok((host, handle, event_rx))
    }

    /// Run the swarm event loop until a shutdown command arrives or every
    /// handle is dropped.
    pub async fn run(mut self) -> Result<(), NetworkError> {
        for (protocol, streams) in std::mem::take(&mut self.incoming) {
            tokio::spawn(accept_streams(
                protocol,
                streams,
                self.event_tx.clone(),
                self.inbound_timeout,
            ));
        }

        for addr in self.discovery_manager.config().bootstrap_peers.clone() {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                tracing::warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            }
        }

        let shutdown = loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(SwarmCommand::Shutdown { reply }) => break Some(reply),
                    Some(cmd) => self.handle_command(cmd),
                    None => break None,
                },
            }
        };

        tracing::info!("Swarm host shutting down");
        drop(self);
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
        Ok(())
    }

    // ---- Event Handling ----

    async fn handle_swarm_event(&mut self, event: SwarmEvent<SwarmBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(behaviour_event).await;
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, num_established, ..
            } => {
                tracing::debug!(peer = %peer_id, endpoint = ?endpoint, "Connection established");
                self.discovery_manager.add_peer(peer_id);
                if num_established.get() == 1 {
                    self.emit(NetworkEvent::PeerConnected(peer_id)).await;
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id, cause, num_established, ..
            } => {
                tracing::debug!(peer = %peer_id, cause = ?cause, "Connection closed");
                if num_established == 0 {
                    self.emit(NetworkEvent::PeerDisconnected(peer_id)).await;
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(addr = %address, "Listening on");
                self.emit(NetworkEvent::Listening(address)).await;
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!(peer = ?peer_id, error = %error, "Outgoing connection failed");
            }
            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: SwarmBehaviourEvent) {
        match event {
            SwarmBehaviourEvent::Mdns(mdns::Event::Discovered(list)) => {
                let appeared = self.discovery_manager.on_mdns_discovered(list.into_iter());
                for (peer_id, addrs) in appeared {
                    let opts = DialOpts::peer_id(peer_id).addresses(addrs).build();
                    if let Err(e) = self.swarm.dial(opts) {
                        tracing::debug!(peer = %peer_id, error = %e, "Dial after discovery failed");
                    }
                    self.emit(NetworkEvent::PeerDiscovered(peer_id)).await;
                }
            }
            SwarmBehaviourEvent::Mdns(mdns::Event::Expired(list)) => {
                self.discovery_manager.on_mdns_expired(list.into_iter());
            }
            SwarmBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!(
                    peer = %peer_id,
                    agent = %info.agent_version,
                    "Peer identified"
                );
                self.emit(NetworkEvent::PeerIdentified {
                    peer: peer_id,
                    agent_version: info.agent_version,
                    listen_addrs: info.listen_addrs,
                })
                .await;
            }
            SwarmBehaviourEvent::Ping(ping::Event {
                peer,
                result: Ok(rtt),
                ..
            }) => {
                self.emit(NetworkEvent::PingRtt { peer, rtt }).await;
            }
            _ => {}
        }
    }

    async fn emit(&mut self, event: NetworkEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::trace!("Network event receiver dropped");
        }
    }

    // ---- Command Handling ----

    fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Dial { addr, reply } => {
                let result = self
                    .swarm
                    .dial(addr)
                    .map_err(|e| NetworkError::DialError(e.to_string()));
                let _ = reply.send(result);
            }
            SwarmCommand::Shutdown { .. } => {}
        }
    }
}

/// Serve every inbound stream negotiated for `protocol` on its own task.
async fn accept_streams(
    protocol: Protocol,
    mut streams: IncomingStreams,
    event_tx: mpsc::Sender<NetworkEvent>,
    timeout: Duration,
) {
    while let Some((peer, mut stream)) = streams.next().await {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(peer, protocol, &mut stream, &event_tx, timeout).await {
                tracing::warn!(peer = %peer, protocol = %protocol, error = %e, "Inbound exchange failed");
            }
        });
    }
}

async fn serve_stream(
    peer: PeerId,
    protocol: Protocol,
    stream: &mut libp2p::Stream,
    event_tx: &mpsc::Sender<NetworkEvent>,
    timeout: Duration,
) -> Result<(), NetworkError> {
    let payload = exchange::read_payload(stream).await?;
    let (request, reply) = InboundRequest::new(peer, protocol, payload);
    event_tx
        .send(NetworkEvent::InboundRequest(request))
        .await
        .map_err(|_| NetworkError::ChannelClosed)?;
    let response = tokio::time::timeout(timeout, reply)
        .await
        .map_err(|_| NetworkError::Timeout(timeout))?
        .map_err(|_| NetworkError::ChannelClosed)?;
    exchange::write_payload(stream, &response).await
}
