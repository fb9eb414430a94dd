//! Phonendo protocol - roles, operations and wire payloads
//!
//! Defines the closed set of functional roles a peer can advertise, the named
//! request/response operations each role exposes, and the UTF-8 payload
//! conventions (`key##json`, `[[key, value], ...]` item lists, error payloads)
//! spoken over every stream.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod role;
pub mod types;
pub mod wire;

pub use constants::*;
pub use error::*;
pub use protocol::Protocol;
pub use role::Role;
pub use types::*;
