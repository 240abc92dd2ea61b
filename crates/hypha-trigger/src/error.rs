use thiserror::Error;

/// Result type alias for trigger operations
pub type TriggerResult<T> = std::result::Result<T, TriggerError>;

/// Errors from the trigger store and dispatcher
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("invalid trigger: {0}")]
    Invalid(String),

    /// A stream payload that does not decode as an event.
    #[error("undecodable event: {0}")]
    Decode(String),

    #[error("bus error: {0}")]
    Bus(#[from] hypha_bus::BusError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TriggerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
