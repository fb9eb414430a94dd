//! The request/response contract every transport offers to the mesh.
//!
//! One exchange is one stream: the caller writes its whole payload and closes
//! its write half, the responder reads to EOF, writes a single reply and
//! closes. Handlers above this layer never see partial frames.

use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::PeerId;
use tokio::sync::oneshot;

use phonendo_protocol::{Protocol, MAX_PAYLOAD_BYTES, PING_PAYLOAD_SIZE};

use crate::NetworkError;

/// Outbound side of the transport, as consumed by the role registry and the
/// dispatcher client.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Identity of the local node.
    fn local_peer_id(&self) -> PeerId;

    /// Run one request/response exchange with `peer` on `protocol`.
    async fn request(
        &self,
        peer: PeerId,
        protocol: Protocol,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkError>;

    /// Round-trip liveness probe.
    async fn ping(&self, peer: PeerId) -> Result<Duration, NetworkError>;
}

/// A fully read inbound request waiting for its single reply.
#[derive(Debug)]
pub struct InboundRequest {
    pub peer: PeerId,
    pub protocol: Protocol,
    pub payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl InboundRequest {
    pub fn new(
        peer: PeerId,
        protocol: Protocol,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                peer,
                protocol,
                payload,
                reply,
            },
            rx,
        )
    }

    /// Send the reply. Fails only if the requester already went away.
    pub fn respond(self, payload: Vec<u8>) -> Result<(), NetworkError> {
        self.reply
            .send(payload)
            .map_err(|_| NetworkError::ChannelClosed)
    }
}

/// Read a complete payload up to EOF, refusing anything over the size cap.
pub async fn read_payload<S>(stream: &mut S) -> Result<Vec<u8>, NetworkError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    stream
        .take(MAX_PAYLOAD_BYTES as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > MAX_PAYLOAD_BYTES {
        return Err(NetworkError::PayloadTooLarge(buf.len()));
    }
    Ok(buf)
}

/// Write a complete payload and close the write half.
pub async fn write_payload<S>(stream: &mut S, payload: &[u8]) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(NetworkError::PayloadTooLarge(payload.len()));
    }
    stream.write_all(payload).await?;
    stream.close().await?;
    Ok(())
}

/// Client half of an exchange on an already negotiated stream.
pub async fn exchange<S>(stream: &mut S, payload: &[u8]) -> Result<Vec<u8>, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_payload(stream, payload).await?;
    read_payload(stream).await
}

/// Probe half of the ping protocol: echo a random payload and time it.
pub async fn probe<S>(stream: &mut S) -> Result<Duration, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload: [u8; PING_PAYLOAD_SIZE] = rand::random();
    let started = std::time::Instant::now();
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let mut echo = [0u8; PING_PAYLOAD_SIZE];
    stream.read_exact(&mut echo).await?;
    let rtt = started.elapsed();
    let _ = stream.close().await;

    if echo != payload {
        return Err(NetworkError::Stream("ping payload mismatch".into()));
    }
    Ok(rtt)
}
