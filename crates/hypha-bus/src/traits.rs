//! Interfaces the runtime core consumes.
//!
//! Everything here is broker-agnostic: the in-memory bus implements the full
//! surface, while remote adapters may support a subset and report
//! [`BusError::Unsupported`](crate::BusError::Unsupported) for the rest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::BusResult;

/// Shared single-use reply slot. The first `respond` wins; later calls are
/// no-ops, matching the per-correlation reply contract of the bus.
#[derive(Clone)]
pub(crate) struct ReplySlot(Arc<Mutex<Option<oneshot::Sender<Bytes>>>>);

impl ReplySlot {
    pub(crate) fn new(tx: oneshot::Sender<Bytes>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    fn take(&self) -> Option<oneshot::Sender<Bytes>> {
        self.0.lock().take()
    }
}

/// A message delivered to a subscription.
#[derive(Clone)]
pub struct BusMessage {
    subject: String,
    payload: Bytes,
    deadline: Option<Instant>,
    reply: Option<ReplySlot>,
}

impl BusMessage {
    pub(crate) fn new(
        subject: String,
        payload: Bytes,
        deadline: Option<Instant>,
        reply: Option<ReplySlot>,
    ) -> Self {
        Self {
            subject,
            payload,
            deadline,
            reply,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Deadline propagated from the requester, when one was attached.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the sender is waiting for a reply.
    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Send the reply for this correlation. Returns false when the message
    /// carried no reply slot, a reply was already sent, or the requester has
    /// gone away.
    pub fn respond(&self, payload: Bytes) -> bool {
        match self.reply.as_ref().and_then(ReplySlot::take) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<BusMessage>, guard: SubscriptionGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Receive the next message; `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

pub(crate) struct SubscriptionGuard {
    pub(crate) id: u64,
    pub(crate) on_drop: Box<dyn Fn(u64) + Send + Sync>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        (self.on_drop)(self.id);
    }
}

/// Change notification from a KV bucket watch.
#[derive(Debug, Clone)]
pub struct KvChange {
    pub key: String,
    pub operation: KvOperation,
    /// Present for puts, absent for deletes.
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    Delete,
}

/// Watch handle over a KV bucket.
pub struct KvWatcher {
    rx: broadcast::Receiver<KvChange>,
}

impl KvWatcher {
    pub(crate) fn new(rx: broadcast::Receiver<KvChange>) -> Self {
        Self { rx }
    }

    /// Next change; `None` when the bucket is gone. A lagged watcher skips
    /// ahead rather than failing.
    pub async fn next(&mut self) -> Option<KvChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "kv watcher lagged; skipping ahead");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Durable key-value bucket.
#[async_trait]
pub trait KvBucket: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> BusResult<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes) -> BusResult<()>;

    /// Delete is idempotent; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> BusResult<()>;

    async fn keys(&self) -> BusResult<Vec<String>>;

    /// Watch all keys for changes.
    async fn watch(&self) -> BusResult<KvWatcher>;
}

/// Durable object (blob) bucket.
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> BusResult<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes) -> BusResult<()>;

    /// Delete is idempotent; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> BusResult<()>;
}

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Only messages published after the consumer was created.
    #[default]
    New,
    /// The full retained stream.
    All,
}

/// Configuration for a durable, explicitly-acknowledged consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub deliver_policy: DeliverPolicy,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Total delivery attempts per message.
    pub max_deliver: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: String::new(),
            deliver_policy: DeliverPolicy::New,
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
        }
    }
}

/// Acknowledgment backchannel for one consumer.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, sequence: u64) -> BusResult<()>;
    async fn nak(&self, sequence: u64) -> BusResult<()>;
}

/// A message claimed from a durable consumer. Exactly one of [`ack`] or
/// [`nak`] must be called per claim; an unacked message redelivers after the
/// consumer's ack-wait.
///
/// [`ack`]: StreamMessage::ack
/// [`nak`]: StreamMessage::nak
pub struct StreamMessage {
    pub subject: String,
    pub payload: Bytes,
    pub stream: String,
    pub sequence: u64,
    pub delivery_attempt: u32,
    pub(crate) acker: Arc<dyn Acker>,
}

impl StreamMessage {
    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack(self.sequence).await
    }

    /// Negative acknowledgment: request immediate redelivery.
    pub async fn nak(&self) -> BusResult<()> {
        self.acker.nak(self.sequence).await
    }
}

/// Pull interface over a durable consumer.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Claim the next message. Blocks until one is available; `None` when
    /// the stream has been torn down.
    async fn next(&self) -> Option<StreamMessage>;
}

impl std::fmt::Debug for dyn StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn StreamConsumer").finish_non_exhaustive()
    }
}

/// The messaging bus as the runtime core sees it.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()>;

    /// Request/reply with a deadline.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes>;

    /// Subscribe to a subject pattern. Subscribers sharing a queue group
    /// split deliveries; ungrouped subscribers each receive every message.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>)
        -> BusResult<Subscription>;

    /// Open a KV bucket, creating it if absent. Concurrent creation is
    /// safe: "already exists" is success.
    async fn kv_bucket(&self, name: &str) -> BusResult<Arc<dyn KvBucket>>;

    /// Open an object bucket, creating it if absent.
    async fn object_bucket(&self, name: &str) -> BusResult<Arc<dyn ObjectBucket>>;

    /// Create a stream capturing the given subject patterns. Idempotent.
    async fn create_stream(&self, name: &str, subjects: &[String]) -> BusResult<()>;

    /// Open a durable consumer on a stream. Consumers sharing a durable
    /// name form a load-balancing group.
    async fn consumer(&self, stream: &str, config: ConsumerConfig)
        -> BusResult<Arc<dyn StreamConsumer>>;
}

/// Service endpoint descriptor used by discovery replies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub subject: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
