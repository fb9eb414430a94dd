use std::time::Duration;

use phonendo_network::{NetworkError, PeerId};
use phonendo_protocol::{Protocol, ProtocolError, Role};
use thiserror::Error;

/// Errors surfaced by the mesh layer.
///
/// None of these are fatal to a running node: callers log them and drop or
/// defer the step that failed.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Role {0} is unavailable")]
    RoleUnavailable(Role),

    #[error("Peer {peer} does not support {protocol}")]
    ProtocolUnsupported { peer: PeerId, protocol: Protocol },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Remote handler error: {0}")]
    Remote(String),

    /// A local handler could not serve the request.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl MeshError {
    /// Wrap a decode failure of a peer's response.
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::MalformedPayload(err.to_string())
    }

    /// Wrap a local service failure for the error payload.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }
}
