//! Process-local builtin functions.
//!
//! Builtins are compiled into the embedding binary and looked up by name;
//! no subprocess is started. The catalog is owned by whoever assembles the
//! runtime so tests can build isolated catalogs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use hypha_core::{Event, EventData};

use crate::error::{FunctionError, FunctionResult};

/// A compiled-in function.
#[async_trait]
pub trait BuiltinFunction: Send + Sync {
    /// Process the incoming event and return zero or more derived events.
    async fn execute(&self, event: &Event) -> FunctionResult<Vec<Event>>;
}

/// Name-keyed registry of compiled-in functions.
pub struct BuiltinCatalog {
    functions: RwLock<HashMap<String, Arc<dyn BuiltinFunction>>>,
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// A catalog preloaded with the stock builtins.
    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        catalog.register("example", Arc::new(ExampleFunction));
        catalog
    }

    pub fn register(&self, name: impl Into<String>, function: Arc<dyn BuiltinFunction>) {
        let name = name.into();
        tracing::debug!(name = %name, "registered builtin function");
        self.functions.write().insert(name, function);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinFunction>> {
        self.functions.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.read().keys().cloned().collect()
    }
}

/// The stock `example` function: replies with a single acknowledgment event
/// derived from the input.
pub struct ExampleFunction;

#[async_trait]
impl BuiltinFunction for ExampleFunction {
    async fn execute(&self, event: &Event) -> FunctionResult<Vec<Event>> {
        let mut builder = Event::builder(
            format!("response-{}", event.id()),
            "example-function",
            format!("{}.response", event.ty()),
        )
        .time_now();
        match event.data() {
            Some(EventData::Json(value)) => builder = builder.json_data(value.clone()),
            Some(EventData::Binary(bytes)) => builder = builder.binary_data(bytes.clone()),
            None => {}
        }
        let reply = builder
            .build()
            .map_err(|e| FunctionError::Execution(e.to_string()))?;
        Ok(vec![reply])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_example_function_reply_shape() {
        let event = Event::builder("x-1", "s", "t")
            .json_data(json!({"hello": "world"}))
            .build()
            .unwrap();
        let events = ExampleFunction.execute(&event).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), "response-x-1");
        assert_eq!(events[0].source(), "example-function");
        assert_eq!(events[0].ty(), "t.response");
        assert_eq!(events[0].json_data(), Some(&json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let catalog = BuiltinCatalog::with_defaults();
        assert!(catalog.get("example").is_some());
        assert!(catalog.get("missing").is_none());
    }
}
