//! Transport configuration using TCP + Noise + Yamux.
//!
//! Builds a libp2p Swarm with:
//! - TCP transport (with DNS resolution for bootstrap addresses)
//! - Noise protocol for authenticated encryption
//! - Yamux for stream multiplexing, which also gives every request stream the
//!   half-close the request/response framing relies on

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::Swarm;

use crate::behaviour::{BehaviourConfig, SwarmBehaviour};
use crate::NetworkError;

/// Configuration for the transport layer.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long an idle connection stays open before being closed.
    pub idle_connection_timeout: Duration,
    /// Behaviour configuration.
    pub behaviour_config: BehaviourConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_connection_timeout: Duration::from_secs(300),
            behaviour_config: BehaviourConfig::default(),
        }
    }
}

/// Build a fully configured libp2p Swarm.
///
/// A fresh Ed25519 identity is generated unless `keypair` is given; roles are
/// re-derived through discovery on every start, so nothing depends on the
/// identity surviving restarts.
pub fn build_swarm(
    keypair: Option<Keypair>,
    config: TransportConfig,
) -> Result<Swarm<SwarmBehaviour>, NetworkError> {
    let keypair = keypair.unwrap_or_else(Keypair::generate_ed25519);
    let behaviour = SwarmBehaviour::new(&keypair, &config.behaviour_config)?;

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(|e| NetworkError::Transport(format!("TCP transport error: {e}")))?
        .with_dns()
        .map_err(|e| NetworkError::Transport(format!("DNS transport error: {e}")))?
        .with_behaviour(|_key| behaviour)
        .map_err(|e| NetworkError::Behaviour(e.to_string()))?
        .with_swarm_config(|c| {
            c.with_idle_connection_timeout(config.idle_connection_timeout)
        })
        .build();

    Ok(swarm)
}
