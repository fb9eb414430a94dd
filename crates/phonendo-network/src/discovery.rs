//! Peer discovery: mDNS local scanning and bootstrap addresses.
//!
//! Discovery only answers "peer X appeared"; what role X plays is learned
//! afterwards by the mesh through the discover handshake. This module keeps
//! just enough state to turn raw mDNS churn into one event per appearance.

use std::collections::HashSet;

use libp2p::{Multiaddr, PeerId};

/// Configuration for peer discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Addresses dialled on startup, for networks without multicast.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Whether mDNS local discovery is enabled.
    pub mdns_enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            mdns_enabled: true,
        }
    }
}

/// Tracks which peers are currently visible so that repeated mDNS responses
/// for the same peer collapse into a single discovery event.
pub struct DiscoveryManager {
    config: DiscoveryConfig,
    /// Every peer ever seen, from any source.
    known_peers: HashSet<PeerId>,
    /// Peers currently advertised over mDNS.
    mdns_peers: HashSet<PeerId>,
}

impl DiscoveryManager {
    /// Create a new discovery manager with the given configuration.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            known_peers: HashSet::new(),
            mdns_peers: HashSet::new(),
        }
    }

    /// Handle an mDNS discovered event.
    ///
    /// Returns each peer that was not already visible, with all of its
    /// advertised addresses, in first-seen order.
    pub fn on_mdns_discovered(
        &mut self,
        peers: impl Iterator<Item = (PeerId, Multiaddr)>,
    ) -> Vec<(PeerId, Vec<Multiaddr>)> {
        let mut appeared: Vec<(PeerId, Vec<Multiaddr>)> = Vec::new();
        for (peer_id, addr) in peers {
            if let Some((_, addrs)) = appeared.iter_mut().find(|(p, _)| *p == peer_id) {
                addrs.push(addr);
                continue;
            }
            if self.mdns_peers.insert(peer_id) {
                if self.known_peers.insert(peer_id) {
                    tracing::info!(peer = %peer_id, addr = %addr, "mDNS discovered new peer");
                } else {
                    tracing::debug!(peer = %peer_id, addr = %addr, "mDNS peer reappeared");
                }
                appeared.push((peer_id, vec![addr]));
            }
        }
        appeared
    }

    /// Handle an mDNS expired event. Expired peers produce a fresh discovery
    /// event when they are advertised again.
    pub fn on_mdns_expired(&mut self, peers: impl Iterator<Item = (PeerId, Multiaddr)>) {
        for (peer_id, _addr) in peers {
            if self.mdns_peers.remove(&peer_id) {
                tracing::debug!(peer = %peer_id, "mDNS peer expired");
            }
        }
    }

    /// Register a peer learned through a direct connection.
    pub fn add_peer(&mut self, peer_id: PeerId) -> bool {
        self.known_peers.insert(peer_id)
    }

    /// Get the total number of known peers.
    pub fn known_peer_count(&self) -> usize {
        self.known_peers.len()
    }

    /// Whether a peer is currently advertised over mDNS.
    pub fn is_visible(&self, peer_id: &PeerId) -> bool {
        self.mdns_peers.contains(peer_id)
    }

    /// Get the discovery configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn test_duplicate_advertisements_collapse() {
        let mut manager = DiscoveryManager::new(DiscoveryConfig::default());
        let peer = PeerId::random();

        let first = manager.on_mdns_discovered(vec![(peer, addr(1)), (peer, addr(2))].into_iter());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1.len(), 2);

        let again = manager.on_mdns_discovered(vec![(peer, addr(1))].into_iter());
        assert!(again.is_empty());
        assert_eq!(manager.known_peer_count(), 1);
    }

    #[test]
    fn test_expired_peer_is_rediscovered() {
        let mut manager = DiscoveryManager::new(DiscoveryConfig::default());
        let peer = PeerId::random();

        manager.on_mdns_discovered(vec![(peer, addr(1))].into_iter());
        manager.on_mdns_expired(vec![(peer, addr(1))].into_iter());
        assert!(!manager.is_visible(&peer));

        let back = manager.on_mdns_discovered(vec![(peer, addr(1))].into_iter());
        assert_eq!(back.len(), 1);
        assert_eq!(manager.known_peer_count(), 1);
    }
}
