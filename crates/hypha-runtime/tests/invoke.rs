//! End-to-end invocation tests over the embedded bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use hypha_bus::{Bus, MemoryBus};
use hypha_core::Event;
use hypha_runtime::builtin::BuiltinCatalog;
use hypha_runtime::error::FunctionResult;
use hypha_runtime::registry::{FunctionRegistry, MemoryRegistry};
use hypha_runtime::service::{RuntimeService, RuntimeServiceConfig, INVOKE_SUBJECT};
use hypha_runtime::types::{FunctionMeta, KIND_BUILTIN};
use hypha_runtime::{BuiltinFunction, PluginCache, PluginHost};

struct SleepyFunction;

#[async_trait]
impl BuiltinFunction for SleepyFunction {
    async fn execute(&self, _event: &Event) -> FunctionResult<Vec<Event>> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Vec::new())
    }
}

struct FailingFunction;

#[async_trait]
impl BuiltinFunction for FailingFunction {
    async fn execute(&self, _event: &Event) -> FunctionResult<Vec<Event>> {
        Err(hypha_runtime::FunctionError::Execution(
            "database unavailable".into(),
        ))
    }
}

async fn start_runtime(invoke_deadline: Duration) -> (MemoryBus, RuntimeService) {
    let bus = MemoryBus::new();
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .store(
            FunctionMeta::new("example", KIND_BUILTIN, "1.0.0"),
            Bytes::new(),
        )
        .await
        .unwrap();
    registry
        .store(FunctionMeta::new("u", "wat", "1"), Bytes::new())
        .await
        .unwrap();
    registry
        .store(
            FunctionMeta::new("sleepy", KIND_BUILTIN, "1.0.0"),
            Bytes::new(),
        )
        .await
        .unwrap();
    registry
        .store(
            FunctionMeta::new("failing", KIND_BUILTIN, "1.0.0"),
            Bytes::new(),
        )
        .await
        .unwrap();

    let builtins = BuiltinCatalog::with_defaults();
    builtins.register("sleepy", Arc::new(SleepyFunction));
    builtins.register("failing", Arc::new(FailingFunction));

    let cache = Arc::new(PluginCache::new(
        registry,
        Arc::new(builtins),
        Arc::new(PluginHost::default()),
    ));
    let service = RuntimeService::new(
        Arc::new(bus.clone()),
        cache,
        RuntimeServiceConfig {
            invoke_deadline,
            shutdown_grace: Duration::from_millis(200),
            ..Default::default()
        },
    );
    service.start().await.unwrap();
    (bus, service)
}

async fn invoke_raw(bus: &MemoryBus, body: serde_json::Value) -> serde_json::Value {
    let reply = bus
        .request(
            INVOKE_SUBJECT,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    serde_json::from_slice(&reply).unwrap()
}

async fn invoke(bus: &MemoryBus, function: &str, event: &Event) -> serde_json::Value {
    invoke_raw(
        bus,
        json!({
            "functionName": function,
            "event": serde_json::to_value(event).unwrap(),
        }),
    )
    .await
}

#[tokio::test]
async fn test_builtin_happy_path() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let event = Event::builder("x-1", "s", "t").build().unwrap();

    let reply = invoke(&bus, "example", &event).await;
    let events = reply["events"].as_array().expect("events array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["id"], "response-x-1");
    assert_eq!(events[0]["source"], "example-function");

    service.stop().await;
}

#[tokio::test]
async fn test_missing_function_is_plugin_not_found() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let event = Event::builder("x-2", "s", "t").build().unwrap();

    let reply = invoke(&bus, "nope", &event).await;
    assert_eq!(reply["errorType"], "plugin_not_found");

    service.stop().await;
}

#[tokio::test]
async fn test_unsupported_type_is_execution_error() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let event = Event::builder("x-3", "s", "t").build().unwrap();

    let reply = invoke(&bus, "u", &event).await;
    assert_eq!(reply["errorType"], "execution_error");
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .contains("unsupported function type"));

    service.stop().await;
}

#[tokio::test]
async fn test_undecodable_envelope_is_invalid_request() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let reply = bus
        .request(
            INVOKE_SUBJECT,
            Bytes::from_static(b"this is not json"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["errorType"], "invalid_request");

    service.stop().await;
}

#[tokio::test]
async fn test_plugin_error_surfaces_as_execution_error() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let event = Event::builder("x-4", "s", "t").build().unwrap();

    let reply = invoke(&bus, "failing", &event).await;
    assert_eq!(reply["errorType"], "execution_error");
    assert!(reply["error"].as_str().unwrap().contains("database unavailable"));

    service.stop().await;
}

#[tokio::test]
async fn test_deadline_expiry_reports_timeout() {
    let (bus, service) = start_runtime(Duration::from_millis(100)).await;
    let event = Event::builder("x-5", "s", "t").build().unwrap();

    let reply = invoke(&bus, "sleepy", &event).await;
    assert_eq!(reply["errorType"], "execution_error");
    assert!(reply["error"].as_str().unwrap().contains("timeout"));

    service.stop().await;
}

#[tokio::test]
async fn test_empty_event_list_round_trips() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let builtins_event = Event::builder("x-6", "s", "t").build().unwrap();

    // `sleepy` returns an empty list once its nap fits in the deadline.
    let reply = invoke(&bus, "sleepy", &builtins_event).await;
    assert_eq!(reply["events"].as_array().unwrap().len(), 0);

    service.stop().await;
}

#[tokio::test]
async fn test_concurrent_invocations_are_not_serialized() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;

    // Eight 500 ms sleeps finishing well under 8 * 500 ms proves the
    // handler fans out instead of queueing.
    let started = std::time::Instant::now();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            let event = Event::builder(format!("c-{}", i), "s", "t").build().unwrap();
            invoke(&bus, "sleepy", &event).await
        }));
    }
    for task in tasks {
        let reply = task.await.unwrap();
        assert!(reply.get("events").is_some());
    }
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "invocations ran serially: {:?}",
        started.elapsed()
    );

    service.stop().await;
}

#[tokio::test]
async fn test_service_discovery_reports_endpoint_and_stats() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    let event = Event::builder("x-7", "s", "t").build().unwrap();
    invoke(&bus, "example", &event).await;

    let info = bus
        .request(
            "$SRV.INFO.function-runtime",
            Bytes::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let info: serde_json::Value = serde_json::from_slice(&info).unwrap();
    assert_eq!(info["endpoints"][0]["name"], "invoke");
    assert_eq!(info["endpoints"][0]["subject"], "function.invoke");
    assert_eq!(
        info["endpoints"][0]["metadata"]["format"],
        "application/json"
    );

    let stats = bus
        .request(
            "$SRV.STATS.function-runtime",
            Bytes::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let stats: serde_json::Value = serde_json::from_slice(&stats).unwrap();
    assert!(stats["endpoints"][0]["num_requests"].as_u64().unwrap() >= 1);

    service.stop().await;
}

#[tokio::test]
async fn test_stop_deregisters_endpoint() {
    let (bus, service) = start_runtime(Duration::from_secs(5)).await;
    service.stop().await;

    let err = bus
        .request(INVOKE_SUBJECT, Bytes::new(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, hypha_bus::BusError::NoResponders(_)));
}
