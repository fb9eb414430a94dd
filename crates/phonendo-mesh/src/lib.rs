//! Phonendo Mesh - role discovery and pipeline dispatch
//!
//! The layer every Phonendo node runs on top of its transport:
//! - `RoleRegistry`: which peer currently holds each role, with liveness probes
//! - `DiscoveryNegotiator`: discover handshake and role-connect hooks
//! - `Dispatcher` / `RoleClient`: named request/response operations, server
//!   and client side
//! - `Orchestrator`: the capture → verify → publish state machine, the
//!   verifier key cache and reconnection replay with backoff
//! - `MeshRuntime`: routes transport events to the components above

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod negotiator;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod runtime;

pub use dispatcher::{handler, identify_handler, Dispatcher, DispatcherBuilder, Handler, InboundCall, RoleClient};
pub use error::MeshError;
pub use events::{EventBus, PipelineEvent, ReplayEvent};
pub use negotiator::{hook, DiscoveryNegotiator, NegotiatorBuilder, PeerState, RoleHook};
pub use orchestrator::Orchestrator;
pub use registry::RoleRegistry;
pub use replay::{PassOutcome, ReplayController, ReplayPolicy};
pub use runtime::MeshRuntime;
