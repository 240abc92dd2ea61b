//! The Hypha function runtime.
//!
//! Wires four pieces together behind one bus endpoint:
//!
//! - [`registry`]: durable mapping from function name to metadata and
//!   binary bytes, over a KV bucket and an object bucket (or in memory).
//! - [`plugin`]: turns a `(meta, binary)` pair into a callable. Builtin
//!   functions run in-process, external plugins run as handshaked
//!   subprocesses.
//! - [`cache`]: name-keyed cache of live plugin handles with
//!   single-flight loading.
//! - [`service`]: the `function.invoke` request/reply endpoint.

pub mod builtin;
pub mod cache;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod service;
pub mod types;

pub use builtin::{BuiltinCatalog, BuiltinFunction, ExampleFunction};
pub use cache::PluginCache;
pub use error::{FunctionError, RegistryError};
pub use plugin::{PluginHandle, PluginHost, PluginHostConfig};
pub use registry::{BucketRegistry, FunctionRegistry, MemoryRegistry};
pub use service::{RuntimeService, RuntimeServiceConfig};
pub use types::{FunctionKind, FunctionMeta};
