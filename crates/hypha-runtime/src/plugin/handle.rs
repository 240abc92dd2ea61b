//! The in-process accessor to a loaded function.

use std::sync::Arc;

use hypha_core::Event;

use crate::builtin::BuiltinFunction;
use crate::error::FunctionResult;
use crate::plugin::host::RemotePlugin;
use crate::types::FunctionMeta;

enum Backend {
    Builtin(Arc<dyn BuiltinFunction>),
    Remote(RemotePlugin),
}

/// A live function: metadata plus either an in-process callable or a
/// transport to a plugin subprocess. Owned exclusively by the plugin cache;
/// created on first use, retained across invocations, destroyed on eviction
/// or runtime shutdown.
pub struct PluginHandle {
    meta: FunctionMeta,
    backend: Backend,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    pub(crate) fn builtin(meta: FunctionMeta, function: Arc<dyn BuiltinFunction>) -> Self {
        Self {
            meta,
            backend: Backend::Builtin(function),
        }
    }

    pub(crate) fn remote(meta: FunctionMeta, plugin: RemotePlugin) -> Self {
        Self {
            meta,
            backend: Backend::Remote(plugin),
        }
    }

    pub fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Builtins are always live; a remote handle goes dead when its
    /// subprocess does.
    pub fn is_alive(&self) -> bool {
        match &self.backend {
            Backend::Builtin(_) => true,
            Backend::Remote(plugin) => plugin.is_alive(),
        }
    }

    /// Evaluate the function. One handle may service concurrent calls;
    /// serialization, if any, is the plugin's business.
    pub async fn execute(&self, event: &Event) -> FunctionResult<Vec<Event>> {
        match &self.backend {
            Backend::Builtin(function) => function.execute(event).await,
            Backend::Remote(plugin) => plugin.execute(event.clone()).await,
        }
    }

    /// Tear the backend down. For remote plugins this SIGTERMs the child
    /// and waits for exit up to the host's grace period.
    pub async fn close(&self) {
        if let Backend::Remote(plugin) = &self.backend {
            plugin.close().await;
        }
    }
}
