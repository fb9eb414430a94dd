//! A running Phonendo node: one libp2p host plus the mesh for one role.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use phonendo_mesh::MeshRuntime;
use phonendo_network::{
    discovery::DiscoveryConfig, transport::TransportConfig, NetworkEvent, PeerId, PeerTransport,
    SwarmHandle, SwarmHost, SwarmHostConfig,
};

use crate::config::NodeConfig;
use crate::services::{self, Assembly, RoleService};

pub struct PhonendoNode {
    config: NodeConfig,
    host: SwarmHost,
    handle: SwarmHandle,
    events: mpsc::Receiver<NetworkEvent>,
    assembly: Assembly,
}

impl PhonendoNode {
    /// Build the swarm host for the configured role and wire the mesh onto
    /// it. Nothing runs until [`PhonendoNode::run`].
    pub async fn new(config: NodeConfig) -> Result<Self, anyhow::Error> {
        let role = config.node.role;
        let mut transport = TransportConfig::default();
        transport.idle_connection_timeout =
            Duration::from_secs(config.network.idle_connection_timeout_secs);

        let swarm_config = SwarmHostConfig {
            listen_addr: config.listen_multiaddr()?,
            transport,
            discovery: DiscoveryConfig {
                bootstrap_peers: config.bootstrap_multiaddrs(),
                mdns_enabled: config.network.mdns_enabled,
            },
            protocols: services::served_protocols(role),
            inbound_timeout: config.request_timeout(),
            ..Default::default()
        };

        let (host, handle, events) = SwarmHost::new(swarm_config)?;
        let assembly = services::assemble(&config, Arc::new(handle.clone())).await?;

        Ok(Self {
            config,
            host,
            handle,
            events,
            assembly,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.handle.local_peer_id()
    }

    /// Handle for stopping the node from another task.
    pub fn handle(&self) -> SwarmHandle {
        self.handle.clone()
    }

    /// Drive the node until the swarm host stops.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let Self {
            config,
            host,
            handle: _,
            events,
            assembly,
        } = self;

        tracing::info!(
            service = %config.service_name(),
            role = %assembly.role,
            "Mesh ready"
        );

        if let RoleService::Manager(manager) = &assembly.service {
            if manager.start_demo_load().is_some() {
                tracing::info!("Synthetic load starts after the first empty replay");
            }
        }

        let runtime = MeshRuntime::new(assembly.negotiator, assembly.dispatcher).spawn(events);
        let result = host.run().await;
        runtime.abort();
        result?;
        Ok(())
    }
}
