//! Name-keyed cache of live plugin handles.
//!
//! A miss triggers a single-flight load: concurrent callers for the same
//! name await one in-progress load and all see its outcome. The map lock is
//! held only for bookkeeping, never across the load itself. There is no
//! capacity eviction; the cache grows to the set of functions ever invoked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::builtin::BuiltinCatalog;
use crate::error::{FunctionError, FunctionResult};
use crate::plugin::{PluginHandle, PluginHost};
use crate::registry::FunctionRegistry;
use crate::types::FunctionKind;

type LoadFuture = Shared<BoxFuture<'static, FunctionResult<Arc<PluginHandle>>>>;

struct Loading {
    id: u64,
    future: LoadFuture,
}

enum Slot {
    Ready(Arc<PluginHandle>),
    Loading(Loading),
}

/// The plugin cache. One instance per runtime service.
pub struct PluginCache {
    slots: Mutex<HashMap<String, Slot>>,
    next_load_id: AtomicU64,
    registry: Arc<dyn FunctionRegistry>,
    builtins: Arc<BuiltinCatalog>,
    host: Arc<PluginHost>,
}

impl PluginCache {
    pub fn new(
        registry: Arc<dyn FunctionRegistry>,
        builtins: Arc<BuiltinCatalog>,
        host: Arc<PluginHost>,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_load_id: AtomicU64::new(1),
            registry,
            builtins,
            host,
        }
    }

    /// Return the live handle for `name`, loading it on a miss.
    ///
    /// A handle discovered dead here is evicted and the call fails as a
    /// plugin crash; it is not silently retried.
    pub async fn get_or_load(&self, name: &str) -> FunctionResult<Arc<PluginHandle>> {
        enum Plan {
            Hit(Arc<PluginHandle>),
            Dead(Arc<PluginHandle>),
            Join(u64, LoadFuture),
            Start,
        }

        let plan = {
            let slots = self.slots.lock();
            match slots.get(name) {
                Some(Slot::Ready(handle)) if handle.is_alive() => {
                    Plan::Hit(Arc::clone(handle))
                }
                Some(Slot::Ready(handle)) => Plan::Dead(Arc::clone(handle)),
                Some(Slot::Loading(loading)) => Plan::Join(loading.id, loading.future.clone()),
                None => Plan::Start,
            }
        };

        let (load_id, future) = match plan {
            Plan::Hit(handle) => return Ok(handle),
            Plan::Dead(handle) => {
                {
                    let mut slots = self.slots.lock();
                    // Only clear the slot if it still holds this handle; a
                    // racing caller may have begun a fresh load already.
                    if matches!(slots.get(name), Some(Slot::Ready(h)) if Arc::ptr_eq(h, &handle)) {
                        slots.remove(name);
                    }
                }
                tokio::spawn(async move { handle.close().await });
                return Err(FunctionError::PluginCrashed(format!(
                    "plugin '{}' was found dead and has been evicted",
                    name
                )));
            }
            Plan::Join(id, future) => (id, future),
            Plan::Start => {
                let id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
                let future = self.load_future(name);
                // Record the in-flight promise; racing callers join it.
                let mut slots = self.slots.lock();
                match slots.get(name) {
                    // A competing caller won the race between our two
                    // lock acquisitions.
                    Some(Slot::Loading(loading)) => (loading.id, loading.future.clone()),
                    Some(Slot::Ready(handle)) if handle.is_alive() => {
                        return Ok(Arc::clone(handle))
                    }
                    _ => {
                        slots.insert(
                            name.to_string(),
                            Slot::Loading(Loading {
                                id,
                                future: future.clone(),
                            }),
                        );
                        (id, future)
                    }
                }
            }
        };

        let result = future.await;

        // Promote or clear the slot, but only if it still belongs to this
        // load; a concurrent evict-and-reload owns the slot otherwise.
        let mut slots = self.slots.lock();
        if matches!(slots.get(name), Some(Slot::Loading(l)) if l.id == load_id) {
            match &result {
                Ok(handle) => {
                    slots.insert(name.to_string(), Slot::Ready(Arc::clone(handle)));
                }
                Err(_) => {
                    slots.remove(name);
                }
            }
        }
        result
    }

    fn load_future(&self, name: &str) -> LoadFuture {
        let name = name.to_string();
        let registry = Arc::clone(&self.registry);
        let builtins = Arc::clone(&self.builtins);
        let host = Arc::clone(&self.host);
        async move {
            let (meta, binary) = registry.get(&name).await?;
            match meta.loader() {
                FunctionKind::Builtin => {
                    let function = builtins.get(&name).ok_or_else(|| {
                        FunctionError::NotFound(format!(
                            "builtin function '{}' is not compiled in",
                            name
                        ))
                    })?;
                    debug!(function = %name, "loaded builtin function");
                    Ok(Arc::new(PluginHandle::builtin(meta, function)))
                }
                FunctionKind::ExternalPlugin => {
                    let plugin = host.load(&meta, &binary).await?;
                    Ok(Arc::new(PluginHandle::remote(meta, plugin)))
                }
                FunctionKind::Unsupported(kind) => Err(FunctionError::load_failed(
                    &name,
                    format!("unsupported function type '{}'", kind),
                )),
            }
        }
        .boxed()
        .shared()
    }

    /// Close and forget the handle for `name`; the next `get_or_load`
    /// reloads.
    pub async fn evict(&self, name: &str) {
        let slot = self.slots.lock().remove(name);
        if let Some(Slot::Ready(handle)) = slot {
            info!(function = %name, "evicting plugin handle");
            handle.close().await;
        }
    }

    /// Close every handle. Called on runtime shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<PluginHandle>> = {
            let mut slots = self.slots.lock();
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(handle) => Some(handle),
                    Slot::Loading(_) => None,
                })
                .collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RegistryError, RegistryResult};
    use crate::registry::MemoryRegistry;
    use crate::types::{FunctionMeta, KIND_BUILTIN};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Registry that counts lookups and takes a while, to expose
    /// double-loading.
    struct SlowCountingRegistry {
        meta: FunctionMeta,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl FunctionRegistry for SlowCountingRegistry {
        async fn store(&self, _meta: FunctionMeta, _binary: Bytes) -> RegistryResult<()> {
            unimplemented!("not used in this test")
        }

        async fn get(&self, name: &str) -> RegistryResult<(FunctionMeta, Bytes)> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(60)).await;
            if name == self.meta.name {
                Ok((self.meta.clone(), Bytes::new()))
            } else {
                Err(RegistryError::NotFound(name.to_string()))
            }
        }

        async fn list(&self) -> RegistryResult<Vec<FunctionMeta>> {
            Ok(vec![self.meta.clone()])
        }

        async fn delete(&self, _name: &str) -> RegistryResult<()> {
            Ok(())
        }
    }

    fn cache_over(registry: Arc<dyn FunctionRegistry>) -> Arc<PluginCache> {
        Arc::new(PluginCache::new(
            registry,
            Arc::new(BuiltinCatalog::with_defaults()),
            Arc::new(PluginHost::default()),
        ))
    }

    #[tokio::test]
    async fn test_concurrent_get_or_load_is_single_flight() {
        let registry = Arc::new(SlowCountingRegistry {
            meta: FunctionMeta::new("example", KIND_BUILTIN, "1.0.0"),
            gets: AtomicUsize::new(0),
        });
        let cache = cache_over(registry.clone());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(
                async move { cache.get_or_load("example").await },
            ));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(registry.gets.load(Ordering::SeqCst), 1, "one load only");
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle), "all callers share one handle");
        }
    }

    #[tokio::test]
    async fn test_load_failure_reaches_every_waiter() {
        let registry = Arc::new(SlowCountingRegistry {
            meta: FunctionMeta::new("example", KIND_BUILTIN, "1.0.0"),
            gets: AtomicUsize::new(0),
        });
        let cache = cache_over(registry.clone());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.get_or_load("nope").await }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.wire_kind(), "plugin_not_found");
        }
        assert_eq!(registry.gets.load(Ordering::SeqCst), 1);

        // The failed load left no slot behind; a retry loads again.
        let _ = cache.get_or_load("nope").await.unwrap_err();
        assert_eq!(registry.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hit_after_load_skips_registry() {
        let registry = Arc::new(SlowCountingRegistry {
            meta: FunctionMeta::new("example", KIND_BUILTIN, "1.0.0"),
            gets: AtomicUsize::new(0),
        });
        let cache = cache_over(registry.clone());

        cache.get_or_load("example").await.unwrap();
        cache.get_or_load("example").await.unwrap();
        assert_eq!(registry.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_forces_reload() {
        let registry = Arc::new(SlowCountingRegistry {
            meta: FunctionMeta::new("example", KIND_BUILTIN, "1.0.0"),
            gets: AtomicUsize::new(0),
        });
        let cache = cache_over(registry.clone());

        cache.get_or_load("example").await.unwrap();
        cache.evict("example").await;
        cache.get_or_load("example").await.unwrap();
        assert_eq!(registry.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsupported_type_is_load_failure() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .store(FunctionMeta::new("u", "wat", "1"), Bytes::new())
            .await
            .unwrap();
        let cache = cache_over(registry);

        let err = cache.get_or_load("u").await.unwrap_err();
        assert!(matches!(err, FunctionError::LoadFailed { .. }));
        assert_eq!(err.wire_kind(), "execution_error");
    }

    #[tokio::test]
    async fn test_builtin_not_compiled_in_is_not_found() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .store(
                FunctionMeta::new("ghost", KIND_BUILTIN, "1"),
                Bytes::new(),
            )
            .await
            .unwrap();
        let cache = cache_over(registry);

        let err = cache.get_or_load("ghost").await.unwrap_err();
        assert_eq!(err.wire_kind(), "plugin_not_found");
    }
}
