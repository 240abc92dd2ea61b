//! Function metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Function type selecting the builtin loader.
pub const KIND_BUILTIN: &str = "builtin";

/// Function type selecting the subprocess plugin loader.
pub const KIND_EXTERNAL_PLUGIN: &str = "external-plugin";

const NAME_MAX_LEN: usize = 128;

/// Metadata stored for a function. `name` is the stable identity used for
/// registry keys and plugin cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl FunctionMeta {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            version: version.into(),
            config: BTreeMap::new(),
        }
    }

    /// The loader this metadata selects.
    pub fn loader(&self) -> FunctionKind {
        match self.kind.as_str() {
            KIND_BUILTIN => FunctionKind::Builtin,
            KIND_EXTERNAL_PLUGIN => FunctionKind::ExternalPlugin,
            other => FunctionKind::Unsupported(other.to_string()),
        }
    }
}

/// The loader selected by a [`FunctionMeta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    Builtin,
    ExternalPlugin,
    Unsupported(String),
}

/// Validate a function name: `[A-Za-z0-9._-]{1,128}`.
pub fn validate_function_name(name: &str) -> Result<(), RegistryError> {
    let valid_len = !name.is_empty() && name.len() <= NAME_MAX_LEN;
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_function_name("example").is_ok());
        assert!(validate_function_name("team.fn_v2-final").is_ok());
        assert!(validate_function_name(&"a".repeat(128)).is_ok());

        assert!(validate_function_name("").is_err());
        assert!(validate_function_name(&"a".repeat(129)).is_err());
        assert!(validate_function_name("has space").is_err());
        assert!(validate_function_name("sla/sh").is_err());
    }

    #[test]
    fn test_loader_selection() {
        assert_eq!(
            FunctionMeta::new("f", KIND_BUILTIN, "1").loader(),
            FunctionKind::Builtin
        );
        assert_eq!(
            FunctionMeta::new("f", KIND_EXTERNAL_PLUGIN, "1").loader(),
            FunctionKind::ExternalPlugin
        );
        assert_eq!(
            FunctionMeta::new("f", "wat", "1").loader(),
            FunctionKind::Unsupported("wat".to_string())
        );
    }

    #[test]
    fn test_meta_json_shape() {
        let meta = FunctionMeta::new("example", KIND_BUILTIN, "1.0.0");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["name"], "example");
        assert_eq!(json["type"], "builtin");
        assert_eq!(json["version"], "1.0.0");
        // empty config bag stays off the wire
        assert!(json.get("config").is_none());
    }
}
