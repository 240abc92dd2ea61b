//! Error vocabulary for the runtime.
//!
//! Errors are cloneable so a single-flight load can hand the same failure
//! to every waiter.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Result type alias for function/plugin operations
pub type FunctionResult<T> = std::result::Result<T, FunctionError>;

/// Registry-layer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("function not found: {0}")]
    NotFound(String),

    #[error("invalid function name '{0}': must match [A-Za-z0-9._-]{{1,128}}")]
    InvalidName(String),

    /// Metadata exists but does not deserialize.
    #[error("corrupt metadata for function '{name}': {detail}")]
    Corrupt { name: String, detail: String },

    #[error("registry io error: {0}")]
    Io(String),
}

impl From<hypha_bus::BusError> for RegistryError {
    fn from(err: hypha_bus::BusError) -> Self {
        RegistryError::Io(err.to_string())
    }
}

/// Failures along the invocation pipeline
#[derive(Error, Debug, Clone)]
pub enum FunctionError {
    /// The request envelope did not decode.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No registry entry, or a builtin with no compiled-in function.
    #[error("function not found: {0}")]
    NotFound(String),

    /// Subprocess spawn, handshake, or transport setup failed; also covers
    /// unsupported function types.
    #[error("failed to load function '{name}': {detail}")]
    LoadFailed { name: String, detail: String },

    /// The plugin reported a failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The plugin subprocess died with calls in flight, or a handle was
    /// found dead at call time.
    #[error("plugin crashed: {0}")]
    PluginCrashed(String),

    /// The deadline expired before or during execution.
    #[error("execution timeout after {0:?}")]
    Timeout(Duration),

    /// Result serialization failed (internal).
    #[error("failed to encode response: {0}")]
    Response(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl FunctionError {
    pub fn load_failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::LoadFailed {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// The machine-readable kind carried on the wire as `errorType`.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) | Self::Registry(RegistryError::NotFound(_)) => "plugin_not_found",
            Self::LoadFailed { .. }
            | Self::Execution(_)
            | Self::PluginCrashed(_)
            | Self::Timeout(_)
            | Self::Registry(_) => "execution_error",
            Self::Response(_) => "response_error",
        }
    }
}
