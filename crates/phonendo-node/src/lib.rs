//! Phonendo node - binary support for one role of the mesh
//!
//! Loads configuration, builds the libp2p host and wires the mesh for the
//! configured role:
//! - manager: pipeline orchestration and reconnection replay
//! - storage: JSON-file record cache
//! - verifier: Ed25519 signing over canonical JSON
//! - publisher: timestamped ledger
//! - reader: synthetic captures sent to the manager

pub mod config;
pub mod node;
pub mod services;

pub use config::NodeConfig;
pub use node::PhonendoNode;
