//! Integration tests for the libp2p host.
//!
//! These tests spawn two SwarmHost instances on the loopback interface,
//! connect them directly (mDNS disabled) and run real stream exchanges.
//!
//! Note: These tests bind TCP sockets and are ignored by default.

use std::time::Duration;

use tokio::time::timeout;

use phonendo_network::{
    discovery::DiscoveryConfig, Multiaddr, NetworkError, NetworkEvent, PeerId, PeerTransport,
    SwarmHandle, SwarmHost, SwarmHostConfig,
};
use phonendo_protocol::Protocol;

/// Helper: create a loopback SwarmHost answering `protocols`.
fn spawn_node(
    protocols: Vec<Protocol>,
) -> (SwarmHost, SwarmHandle, tokio::sync::mpsc::Receiver<NetworkEvent>) {
    let config = SwarmHostConfig {
        listen_addr: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
        discovery: DiscoveryConfig {
            mdns_enabled: false,
            ..Default::default()
        },
        protocols,
        ..Default::default()
    };
    SwarmHost::new(config).expect("Failed to create SwarmHost")
}

/// Helper: wait for the listening event and return the dialable address.
async fn wait_for_listening(
    rx: &mut tokio::sync::mpsc::Receiver<NetworkEvent>,
    peer: PeerId,
) -> Option<Multiaddr> {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(NetworkEvent::Listening(addr))) => {
                return format!("{addr}/p2p/{peer}").parse().ok();
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Helper: answer inbound requests with a fixed reply, forwarding every
/// other event to the returned receiver.
fn serve(
    mut rx: tokio::sync::mpsc::Receiver<NetworkEvent>,
    reply: &'static str,
) -> tokio::sync::mpsc::Receiver<NetworkEvent> {
    let (tx, out) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                NetworkEvent::InboundRequest(request) => {
                    let _ = request.respond(reply.as_bytes().to_vec());
                }
                other => {
                    let _ = tx.send(other).await;
                }
            }
        }
    });
    out
}

#[tokio::test]
#[ignore = "Binds loopback TCP sockets"]
async fn test_discover_exchange_over_tcp() {
    let (host_a, handle_a, events_a) = spawn_node(vec![Protocol::Discover]);
    let (host_b, handle_b, mut events_b) = spawn_node(vec![Protocol::Discover]);
    let peer_b = handle_b.local_peer_id();

    tokio::spawn(host_a.run());
    tokio::spawn(host_b.run());

    let addr_b = wait_for_listening(&mut events_b, peer_b)
        .await
        .expect("node B should start listening");
    let _events_b = serve(events_b, "phonendo_storage");
    let _events_a = serve(events_a, "phonendo_manager");

    handle_a.dial(addr_b).await.unwrap();

    let reply = timeout(
        Duration::from_secs(10),
        handle_a.request(peer_b, Protocol::Discover, b"discover".to_vec()),
    )
    .await
    .expect("exchange timed out")
    .unwrap();
    assert_eq!(reply, b"phonendo_storage");

    let rtt = handle_a.ping(peer_b).await.unwrap();
    assert!(rtt < Duration::from_secs(5));

    let err = handle_a
        .request(peer_b, Protocol::Pk, b"pk".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::ProtocolUnsupported(_)));

    handle_a.shutdown().await.unwrap();
    handle_b.shutdown().await.unwrap();
}
