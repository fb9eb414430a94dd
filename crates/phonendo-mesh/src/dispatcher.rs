//! Named request/response operations, both sides.
//!
//! The server side is a `Dispatcher`: a fixed table of protocol → handler
//! built once at startup. The client side is a `RoleClient` that addresses
//! peers by role through the registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use phonendo_network::{InboundRequest, NetworkError, PeerId, PeerTransport};
use phonendo_protocol::{wire, Protocol, Role, DEFAULT_REQUEST_TIMEOUT_SECS};

use crate::{MeshError, RoleRegistry};

/// A decoded inbound request handed to a handler.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub peer: PeerId,
    pub protocol: Protocol,
    pub payload: String,
}

/// Async handler for one protocol. The returned string is the reply body.
pub type Handler =
    Arc<dyn Fn(InboundCall) -> BoxFuture<'static, Result<String, MeshError>> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, MeshError>> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

/// The `/discover/1.0.0` handler: answer with this node's role tag.
pub fn identify_handler(role: Role) -> Handler {
    let tag = role.tag();
    handler(move |call| {
        let tag = tag.clone();
        async move {
            tracing::debug!(peer = %call.peer, "Answering discover handshake");
            Ok(tag)
        }
    })
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Builder collecting routes. Mistakes are reported by [`DispatcherBuilder::build`].
#[derive(Default)]
pub struct DispatcherBuilder {
    routes: HashMap<Protocol, Handler>,
    errors: Vec<String>,
}

impl DispatcherBuilder {
    /// Register `handler` for `protocol`.
    pub fn route(mut self, protocol: Protocol, handler: Handler) -> Self {
        if self.routes.insert(protocol, handler).is_some() {
            self.errors
                .push(format!("duplicate route for {}", protocol.name()));
        }
        self
    }

    pub fn build(self) -> Result<Dispatcher, MeshError> {
        if !self.errors.is_empty() {
            return Err(MeshError::Config(self.errors.join("; ")));
        }
        Ok(Dispatcher {
            routes: self.routes,
        })
    }
}

/// Routes each inbound request to its handler and writes back exactly one
/// response.
pub struct Dispatcher {
    routes: HashMap<Protocol, Handler>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Protocols with a route, in wire order. The transport serves these.
    pub fn protocols(&self) -> Vec<Protocol> {
        Protocol::ALL
            .iter()
            .copied()
            .filter(|p| self.routes.contains_key(p))
            .collect()
    }

    /// Serve one transport request.
    pub async fn dispatch(&self, mut request: InboundRequest) {
        let peer = request.peer;
        let protocol = request.protocol;
        let payload = std::mem::take(&mut request.payload);
        let reply = self.handle(peer, protocol, payload).await;
        if let Err(e) = request.respond(reply.into_bytes()) {
            tracing::debug!(peer = %peer, protocol = %protocol, error = %e, "Requester went away");
        }
    }

    /// Run the handler for `protocol` and produce the reply body.
    ///
    /// Handler errors and panics become the error payload. They never
    /// surface as a transport fault.
    pub async fn handle(&self, peer: PeerId, protocol: Protocol, payload: Vec<u8>) -> String {
        let Some(handler) = self.routes.get(&protocol).cloned() else {
            tracing::warn!(peer = %peer, protocol = %protocol, "No route for inbound request");
            return wire::encode_error(&format!("unsupported protocol {}", protocol.name()));
        };

        let payload = match String::from_utf8(payload) {
            Ok(payload) => payload,
            Err(_) => {
                tracing::warn!(peer = %peer, protocol = %protocol, "Inbound payload is not UTF-8");
                return wire::encode_error("payload is not valid UTF-8");
            }
        };

        let call = InboundCall {
            peer,
            protocol,
            payload,
        };
        match tokio::spawn(handler(call)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer, protocol = %protocol, error = %e, "Handler failed");
                wire::encode_error(&e.to_string())
            }
            Err(e) => {
                tracing::error!(peer = %peer, protocol = %protocol, error = %e, "Handler panicked");
                wire::encode_error("internal handler error")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Sends requests to whichever peer currently holds a role.
#[derive(Clone)]
pub struct RoleClient {
    registry: RoleRegistry,
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl RoleClient {
    pub fn new(registry: RoleRegistry, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            registry,
            transport,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// Resolve `role` and run one exchange with its holder.
    ///
    /// An unresolved role fails with `RoleUnavailable` before any request is
    /// sent.
    pub async fn invoke(
        &self,
        role: Role,
        protocol: Protocol,
        payload: impl Into<String>,
    ) -> Result<String, MeshError> {
        let peer = self
            .registry
            .resolve(role)
            .await
            .ok_or(MeshError::RoleUnavailable(role))?;
        self.invoke_peer(peer, protocol, payload).await
    }

    /// Run one exchange with a specific peer, bypassing the registry.
    pub async fn invoke_peer(
        &self,
        peer: PeerId,
        protocol: Protocol,
        payload: impl Into<String>,
    ) -> Result<String, MeshError> {
        let payload: String = payload.into();
        tracing::debug!(peer = %peer, protocol = %protocol, bytes = payload.len(), "Sending request");

        let response = tokio::time::timeout(
            self.timeout,
            self.transport.request(peer, protocol, payload.into_bytes()),
        )
        .await
        .map_err(|_| MeshError::Timeout(self.timeout))?
        .map_err(|e| match e {
            NetworkError::ProtocolUnsupported(_) => MeshError::ProtocolUnsupported { peer, protocol },
            NetworkError::Timeout(d) => MeshError::Timeout(d),
            other => MeshError::Transport(other),
        })?;

        let response = String::from_utf8(response).map_err(MeshError::malformed)?;
        if let Some(message) = wire::decode_error(&response) {
            return Err(MeshError::Remote(message));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Handler {
        handler(|call| async move { Ok(call.payload) })
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let result = Dispatcher::builder()
            .route(Protocol::Capture, echo())
            .route(Protocol::Capture, echo())
            .build();
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[test]
    fn test_protocols_in_wire_order() {
        let dispatcher = Dispatcher::builder()
            .route(Protocol::Pk, echo())
            .route(Protocol::Discover, echo())
            .build()
            .unwrap();
        assert_eq!(dispatcher.protocols(), vec![Protocol::Discover, Protocol::Pk]);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_payload() {
        let dispatcher = Dispatcher::builder()
            .route(
                Protocol::Verify,
                handler(|_| async { Err::<String, _>(MeshError::MalformedPayload("bad".into())) }),
            )
            .build()
            .unwrap();
        let reply = dispatcher
            .handle(PeerId::random(), Protocol::Verify, b"x".to_vec())
            .await;
        assert_eq!(wire::decode_error(&reply).as_deref(), Some("Malformed payload: bad"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let dispatcher = Dispatcher::builder()
            .route(
                Protocol::Publish,
                handler(|call| async move {
                    if call.payload.is_empty() {
                        panic!("boom");
                    }
                    Ok(call.payload)
                }),
            )
            .build()
            .unwrap();
        let reply = dispatcher
            .handle(PeerId::random(), Protocol::Publish, Vec::new())
            .await;
        assert!(wire::decode_error(&reply).is_some());
    }

    #[tokio::test]
    async fn test_unrouted_protocol_answers_error() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        let reply = dispatcher
            .handle(PeerId::random(), Protocol::Cache, b"captured".to_vec())
            .await;
        assert!(wire::decode_error(&reply).is_some());
    }

    #[tokio::test]
    async fn test_identify_handler_replies_with_tag() {
        let dispatcher = Dispatcher::builder()
            .route(Protocol::Discover, identify_handler(Role::Storage))
            .build()
            .unwrap();
        let reply = dispatcher
            .handle(PeerId::random(), Protocol::Discover, b"discover".to_vec())
            .await;
        assert_eq!(reply, "phonendo_storage");
    }
}
