//! The closed set of functional roles a peer can advertise during discovery.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// A fixed functional identity held by a peer.
///
/// On the wire each role is announced as `phonendo_<name>`. Holding a role is
/// advisory: a node only knows which peer it last saw claiming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persists captured, verified and published records.
    Storage,
    /// Signs records and serves its public key.
    Verifier,
    /// Pushes verified records to the publishing sink.
    Publisher,
    /// Capture source feeding new records into the pipeline.
    Reader,
    /// Drives records through capture, verify and publish.
    Manager,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Storage,
        Role::Verifier,
        Role::Publisher,
        Role::Reader,
        Role::Manager,
    ];

    /// Short name used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Verifier => "verifier",
            Self::Publisher => "publisher",
            Self::Reader => "reader",
            Self::Manager => "manager",
        }
    }

    /// Tag sent as the reply to a discover handshake.
    pub fn tag(&self) -> String {
        format!("{}{}", crate::ROLE_TAG_PREFIX, self.as_str())
    }

    /// Parse a wire tag (`phonendo_storage`).
    pub fn from_tag(tag: &str) -> Result<Self, ProtocolError> {
        tag.trim()
            .strip_prefix(crate::ROLE_TAG_PREFIX)
            .and_then(Self::from_name)
            .ok_or_else(|| ProtocolError::UnknownRole(tag.to_string()))
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == name)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    /// Accepts either the short name (`storage`) or the wire tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s.trim()).map_or_else(|| Self::from_tag(s), Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_parse() {
        for role in Role::ALL {
            assert_eq!(Role::from_tag(&role.tag()).unwrap(), role);
        }
    }

    #[test]
    fn test_from_str_accepts_name_and_tag() {
        assert_eq!("verifier".parse::<Role>().unwrap(), Role::Verifier);
        assert_eq!("phonendo_publisher".parse::<Role>().unwrap(), Role::Publisher);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            Role::from_tag("phonendo_oracle"),
            Err(ProtocolError::UnknownRole(_))
        ));
        assert!(Role::from_tag("storage").is_err());
    }
}
