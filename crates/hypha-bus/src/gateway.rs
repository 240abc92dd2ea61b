//! TCP gateway exposing a bus to external tooling.
//!
//! The daemon binds a gateway next to its embedded bus so `hyphactl` can
//! reach the request/reply plane and the buckets from another process. One
//! connection handles one frame at a time; connections are independent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::BusResult;
use crate::remote::{read_frame, to_wire_error, write_frame, WireRequest, WireResponse};
use crate::traits::Bus;

/// A bound gateway. Dropping it stops accepting; existing connections run
/// until their peer hangs up.
pub struct Gateway {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Gateway {
    /// Bind and start serving the given bus.
    pub async fn bind(addr: &str, bus: Arc<dyn Bus>) -> BusResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        info!(%local_addr, "bus gateway listening");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "gateway connection accepted");
                                let bus = Arc::clone(&bus);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, bus).await {
                                        debug!(%peer, error = %e, "gateway connection ended");
                                    }
                                });
                            }
                            Err(e) => error!(error = %e, "gateway accept failed"),
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn handle_connection(mut stream: TcpStream, bus: Arc<dyn Bus>) -> BusResult<()> {
    loop {
        let Some(frame) = read_frame(&mut stream).await? else {
            return Ok(());
        };
        let request: WireRequest = bincode::deserialize(&frame)?;
        let response = dispatch(&bus, request).await;
        let encoded = bincode::serialize(&response)?;
        write_frame(&mut stream, &encoded).await?;
    }
}

async fn dispatch(bus: &Arc<dyn Bus>, request: WireRequest) -> WireResponse {
    let result: BusResult<WireResponse> = async {
        match request {
            WireRequest::Publish { subject, payload } => {
                bus.publish(&subject, Bytes::from(payload)).await?;
                Ok(WireResponse::Ok)
            }
            WireRequest::Request {
                subject,
                payload,
                timeout_ms,
            } => {
                let reply = bus
                    .request(
                        &subject,
                        Bytes::from(payload),
                        Duration::from_millis(timeout_ms),
                    )
                    .await?;
                Ok(WireResponse::Payload(reply.to_vec()))
            }
            WireRequest::KvGet { bucket, key } => {
                let bucket = bus.kv_bucket(&bucket).await?;
                Ok(WireResponse::MaybePayload(
                    bucket.get(&key).await?.map(|b| b.to_vec()),
                ))
            }
            WireRequest::KvPut { bucket, key, value } => {
                let bucket = bus.kv_bucket(&bucket).await?;
                bucket.put(&key, Bytes::from(value)).await?;
                Ok(WireResponse::Ok)
            }
            WireRequest::KvDelete { bucket, key } => {
                let bucket = bus.kv_bucket(&bucket).await?;
                bucket.delete(&key).await?;
                Ok(WireResponse::Ok)
            }
            WireRequest::KvKeys { bucket } => {
                let bucket = bus.kv_bucket(&bucket).await?;
                Ok(WireResponse::Keys(bucket.keys().await?))
            }
            WireRequest::ObjectGet { bucket, key } => {
                let bucket = bus.object_bucket(&bucket).await?;
                Ok(WireResponse::MaybePayload(
                    bucket.get(&key).await?.map(|b| b.to_vec()),
                ))
            }
            WireRequest::ObjectPut { bucket, key, value } => {
                let bucket = bus.object_bucket(&bucket).await?;
                bucket.put(&key, Bytes::from(value)).await?;
                Ok(WireResponse::Ok)
            }
            WireRequest::ObjectDelete { bucket, key } => {
                let bucket = bus.object_bucket(&bucket).await?;
                bucket.delete(&key).await?;
                Ok(WireResponse::Ok)
            }
        }
    }
    .await;

    result.unwrap_or_else(|err| {
        let (kind, message) = to_wire_error(&err);
        WireResponse::Error { kind, message }
    })
}
