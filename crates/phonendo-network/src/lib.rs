//! Phonendo Network - transport adapter over libp2p
//!
//! Provides everything the mesh consumes from the peer-to-peer substrate:
//! - Peer identity and local-network discovery via mDNS (plus optional
//!   bootstrap addresses)
//! - Request/response exchanges over streams addressed by protocol name,
//!   carried by TCP + Noise + Yamux and `libp2p-stream`
//! - On-demand liveness probes speaking the standard ping protocol
//! - An in-process [`MemoryNetwork`] implementing the same [`PeerTransport`]
//!   contract for tests and single-process demos

pub mod behaviour;
pub mod discovery;
pub mod exchange;
pub mod memory;
pub mod swarm_host;
pub mod transport;

pub use behaviour::SwarmBehaviour;
pub use discovery::DiscoveryConfig;
pub use exchange::{InboundRequest, PeerTransport};
pub use libp2p::{Multiaddr, PeerId};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use swarm_host::{NetworkEvent, SwarmHandle, SwarmHost, SwarmHostConfig};
pub use transport::build_swarm;

use thiserror::Error;

/// Errors originating from the network layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Behaviour construction error: {0}")]
    Behaviour(String),

    #[error("Dial error: {0}")]
    DialError(String),

    #[error("Listen error: {0}")]
    ListenError(String),

    #[error("Remote peer does not support protocol {0}")]
    ProtocolUnsupported(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Payload of {0} bytes exceeds the maximum size")]
    PayloadTooLarge(usize),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
