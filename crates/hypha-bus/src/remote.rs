//! TCP client for a daemon's bus gateway.
//!
//! Tooling (the `hyphactl` CLI) talks to a running daemon through this
//! adapter: request/reply plus KV and object bucket operations, carried as
//! length-prefixed bincode frames. Subscriptions and stream consumers are
//! daemon-side concerns and are not exposed over the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{BusError, BusResult};
use crate::traits::{
    Bus, ConsumerConfig, KvBucket, KvWatcher, ObjectBucket, StreamConsumer, Subscription,
};

/// Upper bound on a single frame; function binaries ride through here.
pub(crate) const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WireRequest {
    Publish {
        subject: String,
        payload: Vec<u8>,
    },
    Request {
        subject: String,
        payload: Vec<u8>,
        timeout_ms: u64,
    },
    KvGet {
        bucket: String,
        key: String,
    },
    KvPut {
        bucket: String,
        key: String,
        value: Vec<u8>,
    },
    KvDelete {
        bucket: String,
        key: String,
    },
    KvKeys {
        bucket: String,
    },
    ObjectGet {
        bucket: String,
        key: String,
    },
    ObjectPut {
        bucket: String,
        key: String,
        value: Vec<u8>,
    },
    ObjectDelete {
        bucket: String,
        key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WireResponse {
    Ok,
    Payload(Vec<u8>),
    MaybePayload(Option<Vec<u8>>),
    Keys(Vec<String>),
    Error { kind: WireErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) enum WireErrorKind {
    NoResponders,
    Timeout,
    Other,
}

pub(crate) fn to_wire_error(err: &BusError) -> (WireErrorKind, String) {
    let kind = match err {
        BusError::NoResponders(_) => WireErrorKind::NoResponders,
        BusError::Timeout(_) => WireErrorKind::Timeout,
        _ => WireErrorKind::Other,
    };
    (kind, err.to_string())
}

fn from_wire_error(kind: WireErrorKind, message: String) -> BusError {
    match kind {
        WireErrorKind::NoResponders => BusError::NoResponders(message),
        WireErrorKind::Timeout => BusError::Timeout(message),
        WireErrorKind::Other => BusError::Closed(message),
    }
}

pub(crate) async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> BusResult<()> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(BusError::Invalid(format!(
            "frame of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_FRAME_BYTES
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `None` on clean EOF at a frame boundary.
pub(crate) async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> BusResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(BusError::Invalid(format!("oversized frame: {} bytes", len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Client side of the gateway protocol.
#[derive(Clone)]
pub struct RemoteBus {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    addr: String,
    conn: Mutex<TcpStream>,
}

impl RemoteBus {
    /// Connect to a daemon gateway.
    pub async fn connect(addr: &str) -> BusResult<Self> {
        let conn = TcpStream::connect(addr).await?;
        Ok(Self {
            inner: Arc::new(RemoteInner {
                addr: addr.to_string(),
                conn: Mutex::new(conn),
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    async fn roundtrip(&self, request: &WireRequest) -> BusResult<WireResponse> {
        let frame = bincode::serialize(request)?;
        let mut conn = self.inner.conn.lock().await;
        write_frame(&mut *conn, &frame).await?;
        let reply = read_frame(&mut *conn)
            .await?
            .ok_or_else(|| BusError::Closed(format!("gateway {} closed", self.inner.addr)))?;
        Ok(bincode::deserialize(&reply)?)
    }

    async fn expect_ok(&self, request: &WireRequest) -> BusResult<()> {
        match self.roundtrip(request).await? {
            WireResponse::Ok => Ok(()),
            WireResponse::Error { kind, message } => Err(from_wire_error(kind, message)),
            other => Err(BusError::Serialization(format!(
                "unexpected gateway response: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Bus for RemoteBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        self.expect_ok(&WireRequest::Publish {
            subject: subject.to_string(),
            payload: payload.to_vec(),
        })
        .await
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes> {
        let response = self
            .roundtrip(&WireRequest::Request {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?;
        match response {
            WireResponse::Payload(bytes) => Ok(Bytes::from(bytes)),
            WireResponse::Error { kind, message } => Err(from_wire_error(kind, message)),
            other => Err(BusError::Serialization(format!(
                "unexpected gateway response: {:?}",
                other
            ))),
        }
    }

    async fn subscribe(
        &self,
        _subject: &str,
        _queue_group: Option<&str>,
    ) -> BusResult<Subscription> {
        Err(BusError::Unsupported("subscribe over the gateway"))
    }

    async fn kv_bucket(&self, name: &str) -> BusResult<Arc<dyn KvBucket>> {
        Ok(Arc::new(RemoteKvBucket {
            bus: self.clone(),
            name: name.to_string(),
        }))
    }

    async fn object_bucket(&self, name: &str) -> BusResult<Arc<dyn ObjectBucket>> {
        Ok(Arc::new(RemoteObjectBucket {
            bus: self.clone(),
            name: name.to_string(),
        }))
    }

    async fn create_stream(&self, _name: &str, _subjects: &[String]) -> BusResult<()> {
        Err(BusError::Unsupported("stream creation over the gateway"))
    }

    async fn consumer(
        &self,
        _stream: &str,
        _config: ConsumerConfig,
    ) -> BusResult<Arc<dyn StreamConsumer>> {
        Err(BusError::Unsupported("stream consumers over the gateway"))
    }
}

struct RemoteKvBucket {
    bus: RemoteBus,
    name: String,
}

#[async_trait]
impl KvBucket for RemoteKvBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> BusResult<Option<Bytes>> {
        match self
            .bus
            .roundtrip(&WireRequest::KvGet {
                bucket: self.name.clone(),
                key: key.to_string(),
            })
            .await?
        {
            WireResponse::MaybePayload(value) => Ok(value.map(Bytes::from)),
            WireResponse::Error { kind, message } => Err(from_wire_error(kind, message)),
            other => Err(BusError::Serialization(format!(
                "unexpected gateway response: {:?}",
                other
            ))),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> BusResult<()> {
        self.bus
            .expect_ok(&WireRequest::KvPut {
                bucket: self.name.clone(),
                key: key.to_string(),
                value: value.to_vec(),
            })
            .await
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        self.bus
            .expect_ok(&WireRequest::KvDelete {
                bucket: self.name.clone(),
                key: key.to_string(),
            })
            .await
    }

    async fn keys(&self) -> BusResult<Vec<String>> {
        match self
            .bus
            .roundtrip(&WireRequest::KvKeys {
                bucket: self.name.clone(),
            })
            .await?
        {
            WireResponse::Keys(keys) => Ok(keys),
            WireResponse::Error { kind, message } => Err(from_wire_error(kind, message)),
            other => Err(BusError::Serialization(format!(
                "unexpected gateway response: {:?}",
                other
            ))),
        }
    }

    async fn watch(&self) -> BusResult<KvWatcher> {
        Err(BusError::Unsupported("kv watch over the gateway"))
    }
}

struct RemoteObjectBucket {
    bus: RemoteBus,
    name: String,
}

#[async_trait]
impl ObjectBucket for RemoteObjectBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> BusResult<Option<Bytes>> {
        match self
            .bus
            .roundtrip(&WireRequest::ObjectGet {
                bucket: self.name.clone(),
                key: key.to_string(),
            })
            .await?
        {
            WireResponse::MaybePayload(value) => Ok(value.map(Bytes::from)),
            WireResponse::Error { kind, message } => Err(from_wire_error(kind, message)),
            other => Err(BusError::Serialization(format!(
                "unexpected gateway response: {:?}",
                other
            ))),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> BusResult<()> {
        self.bus
            .expect_ok(&WireRequest::ObjectPut {
                bucket: self.name.clone(),
                key: key.to_string(),
                value: value.to_vec(),
            })
            .await
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        self.bus
            .expect_ok(&WireRequest::ObjectDelete {
                bucket: self.name.clone(),
                key: key.to_string(),
            })
            .await
    }
}
