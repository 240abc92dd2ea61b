//! Service-control layer over the bus.
//!
//! A service is a named set of request/reply endpoints plus the standard
//! discovery subjects: `$SRV.PING`, `$SRV.INFO.<name>` and
//! `$SRV.STATS.<name>`. Endpoint subscriptions share the service name as
//! queue group so multiple instances load-balance; discovery subjects are
//! ungrouped so every instance answers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::BusResult;
use crate::traits::{Bus, BusMessage, EndpointInfo};

/// Subject answered by every service instance.
pub const SRV_PING: &str = "$SRV.PING";

fn info_subject(service: &str) -> String {
    format!("$SRV.INFO.{}", service)
}

fn stats_subject(service: &str) -> String {
    format!("$SRV.STATS.{}", service)
}

/// Descriptor a service advertises about itself.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Handler for one endpoint. Implementations must call
/// [`ServiceRequest::respond`] or [`ServiceRequest::respond_error`] exactly
/// once per request.
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    async fn handle(&self, request: ServiceRequest);
}

/// A single inbound request with its stats bookkeeping attached.
pub struct ServiceRequest {
    message: BusMessage,
    stats: Arc<EndpointStats>,
    received_at: Instant,
}

impl ServiceRequest {
    pub fn subject(&self) -> &str {
        self.message.subject()
    }

    pub fn payload(&self) -> &Bytes {
        self.message.payload()
    }

    /// Deadline propagated from the requester, when present.
    pub fn deadline(&self) -> Option<Instant> {
        self.message.deadline()
    }

    /// Reply successfully.
    pub fn respond(&self, payload: Bytes) {
        self.finish(false, payload);
    }

    /// Reply with an error payload; counted in the endpoint error stats.
    pub fn respond_error(&self, payload: Bytes) {
        self.finish(true, payload);
    }

    fn finish(&self, error: bool, payload: Bytes) {
        let elapsed = self.received_at.elapsed().as_nanos() as u64;
        self.stats
            .processing_time_nanos
            .fetch_add(elapsed, Ordering::Relaxed);
        if error {
            self.stats.num_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.message.respond(payload);
    }
}

#[derive(Default)]
struct EndpointStats {
    num_requests: AtomicU64,
    num_errors: AtomicU64,
    processing_time_nanos: AtomicU64,
}

struct EndpointRuntime {
    info: EndpointInfo,
    handler: Arc<dyn EndpointHandler>,
    stats: Arc<EndpointStats>,
}

/// Builder for a bus service.
pub struct ServiceBuilder {
    info: ServiceInfo,
    endpoints: Vec<EndpointRuntime>,
}

impl ServiceBuilder {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            info: ServiceInfo {
                name: name.into(),
                version: version.into(),
                description: description.into(),
            },
            endpoints: Vec::new(),
        }
    }

    /// Add a request/reply endpoint.
    pub fn endpoint(
        mut self,
        name: impl Into<String>,
        subject: impl Into<String>,
        metadata: BTreeMap<String, String>,
        handler: Arc<dyn EndpointHandler>,
    ) -> Self {
        self.endpoints.push(EndpointRuntime {
            info: EndpointInfo {
                name: name.into(),
                subject: subject.into(),
                metadata,
            },
            handler,
            stats: Arc::new(EndpointStats::default()),
        });
        self
    }

    /// Register the service on the bus and start serving.
    pub async fn start(self, bus: Arc<dyn Bus>) -> BusResult<Service> {
        let shared = Arc::new(ServiceShared {
            id: uuid::Uuid::new_v4().to_string(),
            info: self.info,
            started_at: chrono::Utc::now(),
            endpoints: self.endpoints.into_iter().map(Arc::new).collect(),
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for endpoint in &shared.endpoints {
            let mut sub = bus
                .subscribe(&endpoint.info.subject, Some(&shared.info.name))
                .await?;
            let endpoint = Arc::clone(endpoint);
            let in_flight = Arc::clone(&in_flight);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        message = sub.next() => {
                            let Some(message) = message else { break };
                            endpoint.stats.num_requests.fetch_add(1, Ordering::Relaxed);
                            let handler = Arc::clone(&endpoint.handler);
                            let stats = Arc::clone(&endpoint.stats);
                            let guard = InFlightGuard::enter(&in_flight);
                            tokio::spawn(async move {
                                let _guard = guard;
                                handler
                                    .handle(ServiceRequest {
                                        message,
                                        stats,
                                        received_at: Instant::now(),
                                    })
                                    .await;
                            });
                        }
                    }
                }
            }));
        }

        // Discovery responders.
        for (subject, kind) in [
            (SRV_PING.to_string(), ControlKind::Ping),
            (info_subject(&shared.info.name), ControlKind::Info),
            (stats_subject(&shared.info.name), ControlKind::Stats),
        ] {
            let mut sub = bus.subscribe(&subject, None).await?;
            let shared = Arc::clone(&shared);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        message = sub.next() => {
                            let Some(message) = message else { break };
                            let body = shared.control_reply(kind);
                            message.respond(Bytes::from(body));
                        }
                    }
                }
            }));
        }

        tracing::info!(
            service = %shared.info.name,
            version = %shared.info.version,
            id = %shared.id,
            "service registered"
        );

        Ok(Service {
            shared,
            in_flight,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

#[derive(Clone, Copy)]
enum ControlKind {
    Ping,
    Info,
    Stats,
}

struct ServiceShared {
    id: String,
    info: ServiceInfo,
    started_at: chrono::DateTime<chrono::Utc>,
    endpoints: Vec<Arc<EndpointRuntime>>,
}

impl ServiceShared {
    fn control_reply(&self, kind: ControlKind) -> Vec<u8> {
        let body = match kind {
            ControlKind::Ping => json!({
                "type": "io.hypha.micro.v1.ping_response",
                "name": self.info.name,
                "id": self.id,
                "version": self.info.version,
            }),
            ControlKind::Info => json!({
                "type": "io.hypha.micro.v1.info_response",
                "name": self.info.name,
                "id": self.id,
                "version": self.info.version,
                "description": self.info.description,
                "endpoints": self
                    .endpoints
                    .iter()
                    .map(|e| &e.info)
                    .collect::<Vec<_>>(),
            }),
            ControlKind::Stats => {
                let endpoints: Vec<serde_json::Value> = self
                    .endpoints
                    .iter()
                    .map(|e| {
                        let requests = e.stats.num_requests.load(Ordering::Relaxed);
                        let processing = e.stats.processing_time_nanos.load(Ordering::Relaxed);
                        let average = if requests == 0 { 0 } else { processing / requests };
                        json!({
                            "name": e.info.name,
                            "subject": e.info.subject,
                            "num_requests": requests,
                            "num_errors": e.stats.num_errors.load(Ordering::Relaxed),
                            "processing_time": processing,
                            "average_processing_time": average,
                        })
                    })
                    .collect();
                json!({
                    "type": "io.hypha.micro.v1.stats_response",
                    "name": self.info.name,
                    "id": self.id,
                    "version": self.info.version,
                    "started": self.started_at.to_rfc3339(),
                    "endpoints": endpoints,
                })
            }
        };
        serde_json::to_vec(&body).expect("control reply serializes")
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running service. Dropping it without [`stop`](Service::stop) tears the
/// subscriptions down without draining.
pub struct Service {
    shared: Arc<ServiceShared>,
    in_flight: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.info.name
    }

    /// Deregister from the bus, let in-flight requests finish up to `grace`,
    /// then abort whatever remains.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let abandoned = self.in_flight.load(Ordering::SeqCst);
        if abandoned > 0 {
            tracing::warn!(abandoned, "grace period expired with requests in flight");
        }
        for task in self.tasks {
            task.abort();
        }
        tracing::info!(service = %self.shared.info.name, "service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;

    struct Echo;

    #[async_trait]
    impl EndpointHandler for Echo {
        async fn handle(&self, request: ServiceRequest) {
            let payload = request.payload().clone();
            request.respond(payload);
        }
    }

    async fn start_echo(bus: &MemoryBus) -> Service {
        ServiceBuilder::new("echo-svc", "1.2.3", "test echo service")
            .endpoint(
                "echo",
                "svc.echo",
                BTreeMap::from([("format".to_string(), "application/json".to_string())]),
                Arc::new(Echo),
            )
            .start(Arc::new(bus.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_endpoint_round_trip() {
        let bus = MemoryBus::new();
        let service = start_echo(&bus).await;
        let reply = bus
            .request("svc.echo", Bytes::from_static(b"hello"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"hello");
        service.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_ping_info_stats() {
        let bus = MemoryBus::new();
        let service = start_echo(&bus).await;

        let ping = bus
            .request(SRV_PING, Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let ping: serde_json::Value = serde_json::from_slice(&ping).unwrap();
        assert_eq!(ping["name"], "echo-svc");
        assert_eq!(ping["version"], "1.2.3");

        let info = bus
            .request("$SRV.INFO.echo-svc", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let info: serde_json::Value = serde_json::from_slice(&info).unwrap();
        assert_eq!(info["endpoints"][0]["name"], "echo");
        assert_eq!(info["endpoints"][0]["subject"], "svc.echo");
        assert_eq!(info["endpoints"][0]["metadata"]["format"], "application/json");

        // Drive two requests, then check the counters advanced.
        for _ in 0..2 {
            bus.request("svc.echo", Bytes::from_static(b"x"), Duration::from_secs(1))
                .await
                .unwrap();
        }
        let stats = bus
            .request("$SRV.STATS.echo-svc", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&stats).unwrap();
        assert_eq!(stats["endpoints"][0]["num_requests"], 2);
        assert_eq!(stats["endpoints"][0]["num_errors"], 0);

        service.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_stop_deregisters() {
        let bus = MemoryBus::new();
        let service = start_echo(&bus).await;
        service.stop(Duration::from_millis(100)).await;
        let err = bus
            .request("svc.echo", Bytes::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::BusError::NoResponders(_)));
    }
}
