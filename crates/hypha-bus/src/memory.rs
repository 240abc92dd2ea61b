//! Embedded in-memory bus.
//!
//! Implements the full [`Bus`](crate::traits::Bus) surface for local mode
//! and tests: subject wildcards, queue-group load balancing, request/reply
//! with deadline propagation, KV buckets with watch, object buckets, and
//! streams with durable explicitly-acknowledged consumers (ack-wait
//! redelivery, max-deliver).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::Notify;

use crate::error::{BusError, BusResult};
use crate::subject::subject_matches;
use crate::traits::{
    Acker, Bus, BusMessage, ConsumerConfig, DeliverPolicy, KvBucket, KvChange, KvOperation,
    KvWatcher, ObjectBucket, ReplySlot, StreamConsumer, StreamMessage, Subscription,
    SubscriptionGuard,
};

const KV_WATCH_CAPACITY: usize = 256;

/// The embedded bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<BusShared>,
}

struct BusShared {
    subscriptions: RwLock<HashMap<u64, SubEntry>>,
    next_sub_id: AtomicU64,
    group_cursors: Mutex<HashMap<String, usize>>,
    kv: RwLock<HashMap<String, Arc<MemoryKvBucket>>>,
    objects: RwLock<HashMap<String, Arc<MemoryObjectBucket>>>,
    streams: RwLock<HashMap<String, Arc<MemoryStream>>>,
}

struct SubEntry {
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                subscriptions: RwLock::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                group_cursors: Mutex::new(HashMap::new()),
                kv: RwLock::new(HashMap::new()),
                objects: RwLock::new(HashMap::new()),
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Deliver to matching subscriptions and capture into matching streams.
    /// Returns the number of subscriptions that received the message.
    fn deliver(
        &self,
        subject: &str,
        payload: Bytes,
        deadline: Option<Instant>,
        reply: Option<ReplySlot>,
    ) -> usize {
        let mut receivers: Vec<mpsc::UnboundedSender<BusMessage>> = Vec::new();
        {
            let subs = self.shared.subscriptions.read();
            let mut groups: BTreeMap<&str, Vec<&SubEntry>> = BTreeMap::new();
            for entry in subs.values() {
                if !subject_matches(&entry.pattern, subject) {
                    continue;
                }
                match &entry.queue_group {
                    None => receivers.push(entry.tx.clone()),
                    Some(group) => groups.entry(group.as_str()).or_default().push(entry),
                }
            }
            let mut cursors = self.shared.group_cursors.lock();
            for (group, members) in groups {
                let cursor = cursors.entry(group.to_string()).or_insert(0);
                let chosen = &members[*cursor % members.len()];
                *cursor = cursor.wrapping_add(1);
                receivers.push(chosen.tx.clone());
            }
        }

        let delivered = receivers.len();
        for tx in receivers {
            let _ = tx.send(BusMessage::new(
                subject.to_string(),
                payload.clone(),
                deadline,
                reply.clone(),
            ));
        }

        for stream in self.shared.streams.read().values() {
            if stream.captures(subject) {
                stream.append(subject, payload.clone());
            }
        }

        delivered
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        self.deliver(subject, payload, None, None);
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let delivered = self.deliver(subject, payload, Some(deadline), Some(ReplySlot::new(tx)));
        if delivered == 0 {
            return Err(BusError::NoResponders(subject.to_string()));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(BusError::Closed(format!(
                "request on '{}' was dropped without a reply",
                subject
            ))),
            Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> BusResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscriptions.write().insert(
            id,
            SubEntry {
                pattern: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                tx,
            },
        );
        let shared = Arc::clone(&self.shared);
        let guard = SubscriptionGuard {
            id,
            on_drop: Box::new(move |id| {
                shared.subscriptions.write().remove(&id);
            }),
        };
        Ok(Subscription::new(rx, guard))
    }

    async fn kv_bucket(&self, name: &str) -> BusResult<Arc<dyn KvBucket>> {
        let mut buckets = self.shared.kv.write();
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryKvBucket::new(name)))
            .clone();
        Ok(bucket)
    }

    async fn object_bucket(&self, name: &str) -> BusResult<Arc<dyn ObjectBucket>> {
        let mut buckets = self.shared.objects.write();
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryObjectBucket::new(name)))
            .clone();
        Ok(bucket)
    }

    async fn create_stream(&self, name: &str, subjects: &[String]) -> BusResult<()> {
        let mut streams = self.shared.streams.write();
        streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStream::new(name, subjects)));
        Ok(())
    }

    async fn consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> BusResult<Arc<dyn StreamConsumer>> {
        if config.durable_name.is_empty() {
            return Err(BusError::Invalid("durable name must not be empty".into()));
        }
        if config.max_deliver == 0 {
            return Err(BusError::Invalid("max_deliver must be at least 1".into()));
        }
        let stream = self
            .shared
            .streams
            .read()
            .get(stream)
            .cloned()
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        let shared = stream.durable(&config);
        Ok(Arc::new(DurableConsumer { stream, shared }))
    }
}

// ---------------------------------------------------------------------------
// KV bucket

struct MemoryKvBucket {
    name: String,
    entries: RwLock<BTreeMap<String, Bytes>>,
    changes: broadcast::Sender<KvChange>,
}

impl MemoryKvBucket {
    fn new(name: &str) -> Self {
        let (changes, _) = broadcast::channel(KV_WATCH_CAPACITY);
        Self {
            name: name.to_string(),
            entries: RwLock::new(BTreeMap::new()),
            changes,
        }
    }
}

#[async_trait]
impl KvBucket for MemoryKvBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> BusResult<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> BusResult<()> {
        self.entries.write().insert(key.to_string(), value.clone());
        let _ = self.changes.send(KvChange {
            key: key.to_string(),
            operation: KvOperation::Put,
            value: Some(value),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        let existed = self.entries.write().remove(key).is_some();
        if existed {
            let _ = self.changes.send(KvChange {
                key: key.to_string(),
                operation: KvOperation::Delete,
                value: None,
            });
        }
        Ok(())
    }

    async fn keys(&self) -> BusResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn watch(&self) -> BusResult<KvWatcher> {
        Ok(KvWatcher::new(self.changes.subscribe()))
    }
}

// ---------------------------------------------------------------------------
// Object bucket

struct MemoryObjectBucket {
    name: String,
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryObjectBucket {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ObjectBucket for MemoryObjectBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> BusResult<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> BusResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Streams and durable consumers

struct StoredMessage {
    subject: String,
    payload: Bytes,
}

struct MemoryStream {
    name: String,
    subjects: Vec<String>,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, Arc<ConsumerShared>>,
}

impl MemoryStream {
    fn new(name: &str, subjects: &[String]) -> Self {
        Self {
            name: name.to_string(),
            subjects: subjects.to_vec(),
            inner: Mutex::new(StreamInner {
                messages: Vec::new(),
                consumers: HashMap::new(),
            }),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|p| subject_matches(p, subject))
    }

    fn append(&self, subject: &str, payload: Bytes) {
        let consumers: Vec<Arc<ConsumerShared>> = {
            let mut inner = self.inner.lock();
            inner.messages.push(StoredMessage {
                subject: subject.to_string(),
                payload,
            });
            inner.consumers.values().cloned().collect()
        };
        for consumer in consumers {
            consumer.notify.notify_waiters();
        }
    }

    /// Fetch or create the durable consumer state. Consumers opened under
    /// the same durable name share one delivery cursor.
    fn durable(&self, config: &ConsumerConfig) -> Arc<ConsumerShared> {
        let mut inner = self.inner.lock();
        let start_seq = match config.deliver_policy {
            DeliverPolicy::New => inner.messages.len() as u64 + 1,
            DeliverPolicy::All => 1,
        };
        inner
            .consumers
            .entry(config.durable_name.clone())
            .or_insert_with(|| {
                Arc::new(ConsumerShared {
                    stream_name: self.name.clone(),
                    config: config.clone(),
                    state: Mutex::new(ConsumerState {
                        next_seq: start_seq,
                        pending: BTreeMap::new(),
                    }),
                    notify: Notify::new(),
                })
            })
            .clone()
    }
}

struct ConsumerShared {
    stream_name: String,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    notify: Notify,
}

struct ConsumerState {
    next_seq: u64,
    pending: BTreeMap<u64, PendingDelivery>,
}

struct PendingDelivery {
    attempts: u32,
    redeliver_at: Instant,
}

#[async_trait]
impl Acker for ConsumerShared {
    async fn ack(&self, sequence: u64) -> BusResult<()> {
        self.state.lock().pending.remove(&sequence);
        Ok(())
    }

    async fn nak(&self, sequence: u64) -> BusResult<()> {
        let now = Instant::now();
        if let Some(pending) = self.state.lock().pending.get_mut(&sequence) {
            pending.redeliver_at = now;
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

struct DurableConsumer {
    stream: Arc<MemoryStream>,
    shared: Arc<ConsumerShared>,
}

impl DurableConsumer {
    /// One claim attempt. Returns either a claimed message or the earliest
    /// instant a pending redelivery becomes due.
    fn try_claim(&self) -> (Option<StreamMessage>, Option<Instant>) {
        let inner = self.stream.inner.lock();
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        let ack_wait = self.shared.config.ack_wait;
        let max_deliver = self.shared.config.max_deliver;

        // Redeliveries take priority over new messages.
        let mut due = None;
        let mut earliest: Option<Instant> = None;
        let mut exhausted = Vec::new();
        for (&seq, pending) in state.pending.iter() {
            if pending.redeliver_at > now {
                earliest = Some(earliest.map_or(pending.redeliver_at, |e| e.min(pending.redeliver_at)));
                continue;
            }
            if pending.attempts >= max_deliver {
                exhausted.push(seq);
                continue;
            }
            due = Some(seq);
            break;
        }
        for seq in exhausted {
            state.pending.remove(&seq);
            tracing::warn!(
                stream = %self.shared.stream_name,
                durable = %self.shared.config.durable_name,
                sequence = seq,
                "message exhausted max_deliver; dropping"
            );
        }

        if let Some(seq) = due {
            let pending = state.pending.get_mut(&seq).expect("due entry present");
            pending.attempts += 1;
            pending.redeliver_at = now + ack_wait;
            let attempts = pending.attempts;
            let stored = &inner.messages[(seq - 1) as usize];
            return (Some(self.claimed(stored, seq, attempts)), None);
        }

        if state.next_seq <= inner.messages.len() as u64 {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.insert(
                seq,
                PendingDelivery {
                    attempts: 1,
                    redeliver_at: now + ack_wait,
                },
            );
            let stored = &inner.messages[(seq - 1) as usize];
            return (Some(self.claimed(stored, seq, 1)), None);
        }

        (None, earliest)
    }

    fn claimed(&self, stored: &StoredMessage, sequence: u64, attempt: u32) -> StreamMessage {
        StreamMessage {
            subject: stored.subject.clone(),
            payload: stored.payload.clone(),
            stream: self.shared.stream_name.clone(),
            sequence,
            delivery_attempt: attempt,
            acker: Arc::clone(&self.shared) as Arc<dyn Acker>,
        }
    }
}

#[async_trait]
impl StreamConsumer for DurableConsumer {
    async fn next(&self) -> Option<StreamMessage> {
        loop {
            // Register interest before the claim so a publish between the
            // claim and the await is not missed.
            let notified = self.shared.notify.notified();
            let (claim, next_due) = self.try_claim();
            if let Some(message) = claim {
                return Some(message);
            }
            let wait = next_due
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(200));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
