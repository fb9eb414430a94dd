use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Role};

/// Position of a record in the capture → verify → publish pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Captured,
    Verified,
    Published,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Captured => "captured",
            Self::Verified => "verified",
            Self::Published => "published",
        }
    }

    /// The stage a record enters after its next successful transition.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Captured => Some(Self::Verified),
            Self::Verified => Some(Self::Published),
            Self::Published => None,
        }
    }

    /// The role that owns the transition out of this stage.
    pub fn next_role(&self) -> Option<Role> {
        match self {
            Self::Captured => Some(Role::Verifier),
            Self::Verified => Some(Role::Publisher),
            Self::Published => None,
        }
    }

    /// Whether a record at this stage still awaits a transition.
    pub fn is_pending(&self) -> bool {
        self.next().is_some()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "captured" => Ok(Self::Captured),
            "verified" => Ok(Self::Verified),
            "published" => Ok(Self::Published),
            other => Err(ProtocolError::InvalidStage(other.to_string())),
        }
    }
}

/// A record that completed one pipeline stage but not the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingItem {
    pub key: String,
    pub value: serde_json::Value,
    pub stage: Stage,
}

impl PendingItem {
    pub fn new(key: impl Into<String>, value: serde_json::Value, stage: Stage) -> Self {
        Self {
            key: key.into(),
            value,
            stage,
        }
    }
}

/// A new record entering the pipeline through the capture operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub key: String,
    pub value: serde_json::Value,
}

/// Output of the verifier: the signed source and a hex signature over its
/// canonical serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub source: serde_json::Value,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_progression() {
        assert_eq!(Stage::Captured.next(), Some(Stage::Verified));
        assert_eq!(Stage::Verified.next(), Some(Stage::Published));
        assert_eq!(Stage::Published.next(), None);
        assert!(!Stage::Published.is_pending());
    }

    #[test]
    fn test_next_role() {
        assert_eq!(Stage::Captured.next_role(), Some(Role::Verifier));
        assert_eq!(Stage::Verified.next_role(), Some(Role::Publisher));
        assert_eq!(Stage::Published.next_role(), None);
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!(" verified ".parse::<Stage>().unwrap(), Stage::Verified);
        assert!("signed".parse::<Stage>().is_err());
    }
}
