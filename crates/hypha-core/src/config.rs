//! Runtime configuration shared by the daemon and the service components.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Top-level configuration for a runtime instance.
///
/// Parsed from CLI flags by the binaries; library consumers construct it
/// directly. `Default` yields a working local setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Service descriptor advertised on the bus.
    pub service_name: String,
    pub service_version: String,
    pub service_description: String,

    /// KV bucket holding function metadata.
    pub functions_bucket: String,
    /// Object bucket holding function binaries.
    pub binaries_bucket: String,
    /// KV bucket holding trigger documents.
    pub triggers_bucket: String,

    /// Stream the dispatcher consumes.
    pub event_stream: String,
    /// Subject filter bound to the event stream.
    pub event_subject: String,
    /// Durable consumer name; dispatcher instances sharing it form a
    /// load-balancing group.
    pub durable_name: String,

    /// How long the bus waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Delivery attempts per message before it is dropped.
    pub max_deliver: u32,

    /// Ceiling applied to invocations that carry no client deadline.
    pub invoke_deadline: Duration,
    /// Grace period for in-flight calls during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "function-runtime".to_string(),
            service_version: "1.0.0".to_string(),
            service_description: "Serverless function runtime service".to_string(),
            functions_bucket: "functions".to_string(),
            binaries_bucket: "function-binaries".to_string(),
            triggers_bucket: "triggers".to_string(),
            event_stream: "events".to_string(),
            event_subject: "event.>".to_string(),
            durable_name: "hypha-dispatcher".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            invoke_deadline: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Reject configurations the runtime cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(CoreError::invalid_config("service name must not be empty"));
        }
        if self.functions_bucket.is_empty()
            || self.binaries_bucket.is_empty()
            || self.triggers_bucket.is_empty()
        {
            return Err(CoreError::invalid_config("bucket names must not be empty"));
        }
        if self.functions_bucket == self.binaries_bucket {
            return Err(CoreError::invalid_config(
                "metadata and binary buckets must be distinct",
            ));
        }
        if self.durable_name.is_empty() {
            return Err(CoreError::invalid_config("durable name must not be empty"));
        }
        if self.max_deliver == 0 {
            return Err(CoreError::invalid_config("max_deliver must be at least 1"));
        }
        if self.ack_wait.is_zero() {
            return Err(CoreError::invalid_config("ack_wait must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_shared_bucket_name() {
        let mut cfg = RuntimeConfig::default();
        cfg.binaries_bucket = cfg.functions_bucket.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_max_deliver() {
        let cfg = RuntimeConfig {
            max_deliver: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
