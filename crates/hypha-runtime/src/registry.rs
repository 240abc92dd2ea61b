//! Function registry: name → (metadata, binary).
//!
//! Two implementations share the contract: [`MemoryRegistry`] for tests and
//! local mode, and [`BucketRegistry`] over a durable KV bucket (metadata,
//! JSON-encoded under the function name) plus an object bucket (binary
//! bytes under the same name).
//!
//! Write order is fixed: metadata first, then binary. A binary write
//! failure triggers a best-effort compensating delete of the metadata so no
//! sequence of operations leaves one half without the other. Readers
//! tolerate the transient window where metadata is visible before the
//! binary by retrying the binary read with backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use hypha_bus::{Bus, KvBucket, ObjectBucket};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{validate_function_name, FunctionMeta};

const BINARY_READ_ATTEMPTS: u32 = 3;
const BINARY_READ_BACKOFF: Duration = Duration::from_millis(25);

/// Storage and retrieval of functions.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    /// Atomically store metadata and binary. The binary may be empty for
    /// builtins.
    async fn store(&self, meta: FunctionMeta, binary: Bytes) -> RegistryResult<()>;

    /// Fetch both halves. Never returns one half without the other.
    async fn get(&self, name: &str) -> RegistryResult<(FunctionMeta, Bytes)>;

    /// Enumerate metadata only. Order is unspecified.
    async fn list(&self) -> RegistryResult<Vec<FunctionMeta>>;

    /// Remove both halves. Absence of either is not an error.
    async fn delete(&self, name: &str) -> RegistryResult<()>;
}

/// In-memory registry for tests and local mode.
#[derive(Default)]
pub struct MemoryRegistry {
    functions: RwLock<HashMap<String, (FunctionMeta, Bytes)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionRegistry for MemoryRegistry {
    async fn store(&self, meta: FunctionMeta, binary: Bytes) -> RegistryResult<()> {
        validate_function_name(&meta.name)?;
        self.functions
            .write()
            .insert(meta.name.clone(), (meta, binary));
        Ok(())
    }

    async fn get(&self, name: &str) -> RegistryResult<(FunctionMeta, Bytes)> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn list(&self) -> RegistryResult<Vec<FunctionMeta>> {
        Ok(self
            .functions
            .read()
            .values()
            .map(|(meta, _)| meta.clone())
            .collect())
    }

    async fn delete(&self, name: &str) -> RegistryResult<()> {
        self.functions.write().remove(name);
        Ok(())
    }
}

/// Durable registry over a KV bucket and an object bucket.
pub struct BucketRegistry {
    metadata: Arc<dyn KvBucket>,
    binaries: Arc<dyn ObjectBucket>,
}

impl BucketRegistry {
    pub fn new(metadata: Arc<dyn KvBucket>, binaries: Arc<dyn ObjectBucket>) -> Self {
        Self { metadata, binaries }
    }

    /// Open (creating on first use) the two buckets. Bucket creation is
    /// tolerant of concurrent creation: "already exists" is success.
    pub async fn open(
        bus: &dyn Bus,
        functions_bucket: &str,
        binaries_bucket: &str,
    ) -> RegistryResult<Self> {
        let metadata = bus.kv_bucket(functions_bucket).await?;
        let binaries = bus.object_bucket(binaries_bucket).await?;
        Ok(Self::new(metadata, binaries))
    }
}

#[async_trait]
impl FunctionRegistry for BucketRegistry {
    async fn store(&self, meta: FunctionMeta, binary: Bytes) -> RegistryResult<()> {
        validate_function_name(&meta.name)?;
        let name = meta.name.clone();
        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| RegistryError::Io(format!("encoding metadata: {}", e)))?;

        self.metadata.put(&name, Bytes::from(encoded)).await?;

        if let Err(err) = self.binaries.put(&name, binary).await {
            // Compensate so no metadata survives without its binary.
            if let Err(cleanup) = self.metadata.delete(&name).await {
                warn!(
                    function = %name,
                    error = %cleanup,
                    "compensating metadata delete failed; registry may need repair"
                );
            }
            return Err(err.into());
        }
        debug!(function = %name, "stored function");
        Ok(())
    }

    async fn get(&self, name: &str) -> RegistryResult<(FunctionMeta, Bytes)> {
        let raw = self
            .metadata
            .get(name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let meta: FunctionMeta =
            serde_json::from_slice(&raw).map_err(|e| RegistryError::Corrupt {
                name: name.to_string(),
                detail: e.to_string(),
            })?;

        // The writer commits metadata before the binary; ride out the skew.
        let mut backoff = BINARY_READ_BACKOFF;
        for attempt in 1..=BINARY_READ_ATTEMPTS {
            match self.binaries.get(name).await? {
                Some(binary) => return Ok((meta, binary)),
                None if attempt < BINARY_READ_ATTEMPTS => {
                    debug!(function = %name, attempt, "binary not yet visible; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                None => break,
            }
        }
        Err(RegistryError::Io(format!(
            "binary for function '{}' is not readable",
            name
        )))
    }

    async fn list(&self) -> RegistryResult<Vec<FunctionMeta>> {
        let mut functions = Vec::new();
        for key in self.metadata.keys().await? {
            // Entries can vanish between keys() and get(); skip those.
            let Some(raw) = self.metadata.get(&key).await? else {
                continue;
            };
            let meta: FunctionMeta =
                serde_json::from_slice(&raw).map_err(|e| RegistryError::Corrupt {
                    name: key.clone(),
                    detail: e.to_string(),
                })?;
            functions.push(meta);
        }
        Ok(functions)
    }

    async fn delete(&self, name: &str) -> RegistryResult<()> {
        self.metadata.delete(name).await?;
        self.binaries.delete(name).await?;
        Ok(())
    }
}
