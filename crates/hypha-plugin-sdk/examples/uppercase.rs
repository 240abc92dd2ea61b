//! A complete function plugin: uppercases every string in the payload's
//! `after` half and emits one derived event.
//!
//! Build it and register the binary:
//!
//! ```text
//! cargo build --example uppercase
//! hyphactl function put uppercase --binary target/debug/examples/uppercase
//! ```

use async_trait::async_trait;
use serde_json::Value;

use hypha_core::Event;
use hypha_plugin_sdk::{serve, Function};

struct Uppercase;

fn uppercase_strings(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), uppercase_strings(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(uppercase_strings).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl Function for Uppercase {
    async fn execute(&self, event: Event) -> anyhow::Result<Vec<Event>> {
        let payload = event
            .json_data()
            .cloned()
            .unwrap_or(Value::Object(Default::default()));
        let reply = Event::builder(
            format!("upper-{}", event.id()),
            "uppercase-function",
            format!("{}.uppercased", event.ty()),
        )
        .time_now()
        .json_data(uppercase_strings(&payload))
        .build()?;
        Ok(vec![reply])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    serve(Uppercase).await
}
