//! Tests for the in-process transport.
//!
//! These tests verify that the memory network honours the same contract as
//! the libp2p host: one request, one reply; unsupported protocols refused at
//! negotiation; offline peers failing both requests and probes.

use phonendo_network::{MemoryNetwork, NetworkError, NetworkEvent, PeerTransport};
use phonendo_protocol::Protocol;

/// Answer every inbound request on `rx` with the given reply.
fn serve(mut rx: tokio::sync::mpsc::Receiver<NetworkEvent>, reply: &'static str) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let NetworkEvent::InboundRequest(request) = event {
                let _ = request.respond(reply.as_bytes().to_vec());
            }
        }
    });
}

#[tokio::test]
async fn request_reaches_handler_and_returns_reply() {
    let network = MemoryNetwork::new();
    let (client, _client_rx) = network.join(&[Protocol::Discover]).await;
    let (server, server_rx) = network.join(&[Protocol::Discover, Protocol::Pk]).await;
    serve(server_rx, "PEM");

    let reply = client
        .request(server.local_peer_id(), Protocol::Pk, b"pk".to_vec())
        .await
        .unwrap();
    assert_eq!(reply, b"PEM");
    assert_eq!(network.requests_to(server.local_peer_id(), Protocol::Pk).await, 1);
}

#[tokio::test]
async fn unsupported_protocol_is_refused() {
    let network = MemoryNetwork::new();
    let (client, _rx) = network.join(&[]).await;
    let (server, _server_rx) = network.join(&[Protocol::Capture]).await;

    let err = client
        .request(server.local_peer_id(), Protocol::Discover, b"discover".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::ProtocolUnsupported(_)));
}

#[tokio::test]
async fn offline_peer_fails_probe_and_request() {
    let network = MemoryNetwork::new();
    let (client, _rx) = network.join(&[]).await;
    let (server, _server_rx) = network.join(&[Protocol::Pk]).await;
    let server_id = server.local_peer_id();

    assert!(client.ping(server_id).await.is_ok());
    network.set_online(server_id, false).await;
    assert!(client.ping(server_id).await.is_err());
    assert!(matches!(
        client.request(server_id, Protocol::Pk, vec![]).await,
        Err(NetworkError::DialError(_))
    ));

    network.set_online(server_id, true).await;
    assert!(client.ping(server_id).await.is_ok());
}

#[tokio::test]
async fn announce_is_symmetric() {
    let network = MemoryNetwork::new();
    let (a, mut a_rx) = network.join(&[]).await;
    let (b, mut b_rx) = network.join(&[]).await;

    network.announce(b.local_peer_id()).await;

    match a_rx.recv().await {
        Some(NetworkEvent::PeerDiscovered(peer)) => assert_eq!(peer, b.local_peer_id()),
        other => panic!("unexpected event: {other:?}"),
    }
    match b_rx.recv().await {
        Some(NetworkEvent::PeerDiscovered(peer)) => assert_eq!(peer, a.local_peer_id()),
        other => panic!("unexpected event: {other:?}"),
    }
}
