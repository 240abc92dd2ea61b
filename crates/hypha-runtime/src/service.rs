//! The bus-facing runtime service.
//!
//! Registers one endpoint, `invoke` on subject `function.invoke`, under the
//! service descriptor. Requests are JSON envelopes naming a function and
//! carrying an event; replies carry the derived event list or a typed
//! error. Each delivery is handled on its own task; nothing serializes
//! unrelated invocations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use hypha_bus::{Bus, BusResult, EndpointHandler, Service, ServiceBuilder, ServiceRequest};
use hypha_core::Event;

use crate::cache::PluginCache;
use crate::error::{FunctionError, FunctionResult};

/// The sole invocation subject.
pub const INVOKE_SUBJECT: &str = "function.invoke";

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    #[serde(rename = "functionName")]
    function_name: String,
    event: Event,
}

#[derive(Serialize)]
struct InvokeReply<'a> {
    events: &'a [Event],
}

#[derive(Serialize)]
struct ErrorReply<'a> {
    error: String,
    #[serde(rename = "errorType")]
    error_type: &'a str,
}

/// Descriptor and limits for one runtime service instance.
#[derive(Debug, Clone)]
pub struct RuntimeServiceConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Ceiling for invocations that carry no client deadline.
    pub invoke_deadline: Duration,
    /// Grace period for in-flight calls during `stop`.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeServiceConfig {
    fn default() -> Self {
        Self {
            name: "function-runtime".to_string(),
            version: "1.0.0".to_string(),
            description: "Serverless function runtime service".to_string(),
            invoke_deadline: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// The runtime service: plugin cache behind a request/reply endpoint.
pub struct RuntimeService {
    bus: Arc<dyn Bus>,
    cache: Arc<PluginCache>,
    config: RuntimeServiceConfig,
    service: Mutex<Option<Service>>,
}

impl RuntimeService {
    pub fn new(bus: Arc<dyn Bus>, cache: Arc<PluginCache>, config: RuntimeServiceConfig) -> Self {
        Self {
            bus,
            cache,
            config,
            service: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<PluginCache> {
        &self.cache
    }

    /// Register the service and its endpoint on the bus.
    pub async fn start(&self) -> BusResult<()> {
        let handler = Arc::new(InvokeHandler {
            cache: Arc::clone(&self.cache),
            default_deadline: self.config.invoke_deadline,
        });
        let metadata = BTreeMap::from([
            (
                "description".to_string(),
                "Execute a serverless function against a structured event".to_string(),
            ),
            ("format".to_string(), "application/json".to_string()),
        ]);
        let service = ServiceBuilder::new(
            &self.config.name,
            &self.config.version,
            &self.config.description,
        )
        .endpoint("invoke", INVOKE_SUBJECT, metadata, handler)
        .start(Arc::clone(&self.bus))
        .await?;

        info!(
            service = %self.config.name,
            version = %self.config.version,
            "runtime service started"
        );
        *self.service.lock().await = Some(service);
        Ok(())
    }

    /// Deregister from the bus, drain in-flight calls up to the grace
    /// period, then close the plugin cache.
    pub async fn stop(&self) {
        if let Some(service) = self.service.lock().await.take() {
            service.stop(self.config.shutdown_grace).await;
        }
        self.cache.shutdown().await;
        info!(service = %self.config.name, "runtime service stopped");
    }
}

struct InvokeHandler {
    cache: Arc<PluginCache>,
    default_deadline: Duration,
}

#[async_trait]
impl EndpointHandler for InvokeHandler {
    async fn handle(&self, request: ServiceRequest) {
        let invoke: InvokeRequest = match serde_json::from_slice(request.payload()) {
            Ok(invoke) => invoke,
            Err(e) => {
                warn!(error = %e, "invocation envelope did not decode");
                reply_error(&request, &FunctionError::InvalidRequest(e.to_string()));
                return;
            }
        };

        let name = invoke.function_name;
        let started = Instant::now();
        // The client deadline bounds the call when present; the configured
        // ceiling applies either way.
        let budget = match request.deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.default_deadline),
            None => self.default_deadline,
        };

        let result = if budget.is_zero() {
            Err(FunctionError::Timeout(Duration::ZERO))
        } else {
            self.invoke(&name, &invoke.event, budget).await
        };

        match result {
            Ok(events) => match serde_json::to_vec(&InvokeReply { events: &events }) {
                Ok(body) => {
                    record_invocation(&name, started, "success");
                    request.respond(Bytes::from(body));
                }
                Err(e) => {
                    let err = FunctionError::Response(e.to_string());
                    record_error(&name, err.wire_kind());
                    record_invocation(&name, started, "error");
                    reply_error(&request, &err);
                }
            },
            Err(err) => {
                warn!(function = %name, error = %err, "invocation failed");
                record_error(&name, err.wire_kind());
                record_invocation(&name, started, "error");
                reply_error(&request, &err);
            }
        }
    }
}

impl InvokeHandler {
    async fn invoke(
        &self,
        name: &str,
        event: &Event,
        budget: Duration,
    ) -> FunctionResult<Vec<Event>> {
        let call = async {
            let handle = self.cache.get_or_load(name).await?;
            let result = handle.execute(event).await;
            if matches!(result, Err(FunctionError::PluginCrashed(_))) {
                self.cache.evict(name).await;
            }
            result
        };
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            // Abandon the call; the plugin subprocess is retained for
            // reuse, only the await stops.
            Err(_) => Err(FunctionError::Timeout(budget)),
        }
    }
}

fn reply_error(request: &ServiceRequest, err: &FunctionError) {
    let reply = ErrorReply {
        error: err.to_string(),
        error_type: err.wire_kind(),
    };
    match serde_json::to_vec(&reply) {
        Ok(body) => {
            request.respond_error(Bytes::from(body));
        }
        Err(e) => warn!(error = %e, "failed to encode error reply"),
    }
}

fn record_invocation(function: &str, started: Instant, status: &'static str) {
    counter!(
        "hypha_invocations_total",
        "function" => function.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "hypha_invocation_duration_seconds",
        "function" => function.to_string()
    )
    .record(started.elapsed().as_secs_f64());
}

fn record_error(function: &str, kind: &'static str) {
    counter!(
        "hypha_function_errors_total",
        "function" => function.to_string(),
        "kind" => kind
    )
    .increment(1);
}
