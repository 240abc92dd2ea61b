use thiserror::Error;

/// Result type alias for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors surfaced by bus implementations
#[derive(Error, Debug)]
pub enum BusError {
    /// A request found no subscriber on the subject
    #[error("no responders on subject '{0}'")]
    NoResponders(String),

    /// A request did not complete within its deadline
    #[error("request timed out on subject '{0}'")]
    Timeout(String),

    /// The bus or a subscription has been closed
    #[error("bus closed: {0}")]
    Closed(String),

    /// Named stream does not exist
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Invalid subject or configuration
    #[error("invalid: {0}")]
    Invalid(String),

    /// The implementation does not support this operation
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Transport failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for BusError {
    fn from(err: bincode::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}
