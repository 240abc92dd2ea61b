//! KV-backed trigger store with a live index.
//!
//! Triggers are stored under `<namespace>.<triggerId>` in the `triggers`
//! bucket as JSON. The store loads everything at startup and then follows
//! the bucket's change feed: create/update removes any existing index entry
//! and adds the new one, delete removes the entry from every bucket it may
//! appear in. Index mutations are serialized under the writer lock; readers
//! take the shared lock.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hypha_bus::{Bus, KvBucket, KvChange, KvOperation};

use crate::error::TriggerResult;
use crate::index::NamespaceIndex;
use crate::types::Trigger;

struct State {
    index: NamespaceIndex,
    /// KV key → trigger id, so a delete notification (which carries no
    /// value) can be routed to the right index entry.
    keys: HashMap<String, String>,
}

pub struct TriggerStore {
    bucket: Arc<dyn KvBucket>,
    state: RwLock<State>,
}

impl TriggerStore {
    pub fn new(bucket: Arc<dyn KvBucket>) -> Arc<Self> {
        Arc::new(Self {
            bucket,
            state: RwLock::new(State {
                index: NamespaceIndex::new(),
                keys: HashMap::new(),
            }),
        })
    }

    /// Open (creating on first use) the trigger bucket on `bus`.
    pub async fn open(bus: &dyn Bus, bucket: &str) -> TriggerResult<Arc<Self>> {
        Ok(Self::new(bus.kv_bucket(bucket).await?))
    }

    /// Rebuild the index from the bucket contents.
    pub async fn load_all(&self) -> TriggerResult<()> {
        let mut index = NamespaceIndex::new();
        let mut keys = HashMap::new();
        for key in self.bucket.keys().await? {
            let Some(raw) = self.bucket.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<Trigger>(&raw) {
                Ok(trigger) => {
                    keys.insert(key, trigger.id.clone());
                    index.add(trigger);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable trigger");
                }
            }
        }
        let count = index.len();
        *self.state.write() = State { index, keys };
        info!(triggers = count, "trigger index loaded");
        Ok(())
    }

    /// Follow the bucket's change feed until `shutdown` flips. The returned
    /// task is the sole index writer.
    pub async fn start_watch(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> TriggerResult<JoinHandle<()>> {
        let mut watcher = self.bucket.watch().await?;
        let store = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    change = watcher.next() => {
                        let Some(change) = change else { break };
                        store.apply(change);
                    }
                }
            }
        }))
    }

    fn apply(&self, change: KvChange) {
        let mut state = self.state.write();
        match change.operation {
            KvOperation::Put => {
                let Some(raw) = change.value else { return };
                let trigger = match serde_json::from_slice::<Trigger>(&raw) {
                    Ok(trigger) => trigger,
                    Err(e) => {
                        warn!(key = %change.key, error = %e, "ignoring undecodable trigger update");
                        return;
                    }
                };
                debug!(key = %change.key, trigger = %trigger.id, "trigger upserted");
                if let Some(old_id) = state.keys.get(&change.key).cloned() {
                    state.index.remove(&old_id);
                }
                state.index.remove(&trigger.id);
                state.keys.insert(change.key, trigger.id.clone());
                state.index.add(trigger);
            }
            KvOperation::Delete => {
                if let Some(id) = state.keys.remove(&change.key) {
                    debug!(key = %change.key, trigger = %id, "trigger deleted");
                    state.index.remove(&id);
                }
            }
        }
    }

    /// Triggers whose namespace selection covers `namespace`.
    pub fn get_triggers(&self, namespace: &str) -> Vec<Trigger> {
        self.state.read().index.lookup(namespace)
    }

    /// Every trigger in the index.
    pub fn all_triggers(&self) -> Vec<Trigger> {
        self.state.read().index.all()
    }

    /// Persist a trigger under `<namespace>.<id>`. The index follows via
    /// the change feed.
    pub async fn save(&self, namespace: &str, trigger: &Trigger) -> TriggerResult<()> {
        trigger.validate()?;
        let key = format!("{}.{}", namespace, trigger.id);
        let encoded = serde_json::to_vec(trigger)?;
        self.bucket.put(&key, Bytes::from(encoded)).await?;
        Ok(())
    }

    /// Remove the trigger stored under `<namespace>.<id>`.
    pub async fn delete(&self, namespace: &str, id: &str) -> TriggerResult<()> {
        let key = format!("{}.{}", namespace, id);
        self.bucket.delete(&key).await?;
        Ok(())
    }
}
