//! Named request/response operations exposed on the mesh.
//!
//! Every operation is a single exchange over one stream negotiated under
//! `/<name>/1.0.0`. The set is closed so that unknown names fail when a route
//! table is built instead of silently never matching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Role handshake: request is a constant, reply is the role tag.
    Discover,
    /// Accept a new record (reader → manager, manager → storage).
    Capture,
    /// Sign a record (→ verifier) or persist its signature (→ storage).
    Verify,
    /// Publish a record (→ publisher) or mark it published (→ storage).
    Publish,
    /// Fetch the verifier public key.
    Pk,
    /// Fetch every pending item from storage.
    Reconnect,
    /// Fetch pending items at one stage from storage.
    Cache,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Discover,
        Protocol::Capture,
        Protocol::Verify,
        Protocol::Publish,
        Protocol::Pk,
        Protocol::Reconnect,
        Protocol::Cache,
    ];

    /// Full stream protocol name, e.g. `/capture/1.0.0`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discover => "/discover/1.0.0",
            Self::Capture => "/capture/1.0.0",
            Self::Verify => "/verify/1.0.0",
            Self::Publish => "/publish/1.0.0",
            Self::Pk => "/pk/1.0.0",
            Self::Reconnect => "/reconnect/1.0.0",
            Self::Cache => "/cache/1.0.0",
        }
    }

    /// Bare operation name, e.g. `capture`.
    pub fn operation(&self) -> &'static str {
        let name = self.name();
        let end = name.len() - crate::PROTOCOL_SUFFIX.len() - 1;
        &name[1..end]
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    /// Accepts the full stream name or the bare operation name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s || p.operation() == s)
            .ok_or_else(|| ProtocolError::UnknownProtocol(s.to_string()))
    }
}
