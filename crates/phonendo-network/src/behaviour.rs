//! Custom NetworkBehaviour composing mDNS + Identify + Ping + Stream.
//!
//! - **mDNS**: local network discovery; the only source of "peer appeared"
//!   events on a LAN deployment (toggled off when disabled in config)
//! - **Identify**: exchanges listen addresses and the protocol version
//! - **Ping**: answers inbound liveness probes and keeps RTT estimates
//! - **Stream**: raw protocol-addressed streams carrying every mesh operation

use std::time::Duration;

use libp2p::{
    identify, mdns, ping,
    identity::Keypair,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};

use crate::NetworkError;

/// Composite NetworkBehaviour for a Phonendo node.
///
/// The derive macro generates `SwarmBehaviourEvent` with one variant per
/// field; the stream behaviour emits no events and is driven through its
/// `Control` handle instead.
#[derive(NetworkBehaviour)]
pub struct SwarmBehaviour {
    /// mDNS for automatic local peer discovery.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Identify protocol for exchanging peer metadata.
    pub identify: identify::Behaviour,
    /// Ping for round-trip times and serving inbound probes.
    pub ping: ping::Behaviour,
    /// Protocol-addressed request/response streams.
    pub stream: libp2p_stream::Behaviour,
}

/// Configuration for constructing the composite behaviour.
#[derive(Debug, Clone)]
pub struct BehaviourConfig {
    /// Protocol version string for identify.
    pub protocol_version: String,
    /// Whether mDNS discovery runs at all.
    pub mdns_enabled: bool,
    /// mDNS query interval.
    pub mdns_query_interval: Duration,
    /// Background ping interval.
    pub ping_interval: Duration,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            protocol_version: phonendo_protocol::PROTOCOL_VERSION.to_string(),
            mdns_enabled: true,
            mdns_query_interval: Duration::from_secs(phonendo_protocol::MDNS_QUERY_INTERVAL_SECS),
            ping_interval: Duration::from_secs(15),
        }
    }
}

impl SwarmBehaviour {
    /// Construct a new composite behaviour from a keypair and configuration.
    pub fn new(key: &Keypair, config: &BehaviourConfig) -> Result<Self, NetworkError> {
        let peer_id = key.public().to_peer_id();

        // -- mDNS --
        let mdns = if config.mdns_enabled {
            let mdns_config = mdns::Config {
                query_interval: config.mdns_query_interval,
                ..Default::default()
            };
            let behaviour = mdns::tokio::Behaviour::new(mdns_config, peer_id)
                .map_err(|e| NetworkError::Behaviour(format!("mDNS init error: {e}")))?;
            Some(behaviour)
        } else {
            None
        };

        // -- Identify --
        let identify_config =
            identify::Config::new(config.protocol_version.clone(), key.public())
                .with_push_listen_addr_updates(true);
        let identify = identify::Behaviour::new(identify_config);

        // -- Ping --
        let ping = ping::Behaviour::new(
            ping::Config::new().with_interval(config.ping_interval),
        );

        Ok(Self {
            mdns: Toggle::from(mdns),
            identify,
            ping,
            stream: libp2p_stream::Behaviour::new(),
        })
    }
}
