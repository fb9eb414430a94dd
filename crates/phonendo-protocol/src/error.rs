use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown role tag: {0}")]
    UnknownRole(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Key contains the reserved delimiter '##': {0}")]
    DelimiterInKey(String),

    #[error("Payload is missing the '##' delimiter")]
    MissingDelimiter,

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}
