//! External plugin loader and subprocess lifecycle.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hypha_core::Event;
use hypha_plugin_sdk::protocol::{Handshake, COOKIE_ENV, COOKIE_VALUE, SOCKET_DIR_ENV};

use crate::error::{FunctionError, FunctionResult};
use crate::plugin::rpc::RpcClient;
use crate::types::FunctionMeta;

/// Tunables for the subprocess lifecycle.
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    /// How long the child has to produce its handshake line.
    pub handshake_timeout: Duration,
    /// How long a closing child gets between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Turns `(meta, binary)` pairs into live subprocess-backed plugins.
pub struct PluginHost {
    config: PluginHostConfig,
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new(PluginHostConfig::default())
    }
}

impl PluginHost {
    pub fn new(config: PluginHostConfig) -> Self {
        Self { config }
    }

    /// Write the binary to a scratch directory, spawn it, and complete the
    /// handshake. The returned plugin owns the subprocess.
    pub async fn load(&self, meta: &FunctionMeta, binary: &[u8]) -> FunctionResult<RemotePlugin> {
        let name = meta.name.clone();
        let scratch = tempfile::Builder::new()
            .prefix("hypha-plugin-")
            .tempdir()
            .map_err(|e| FunctionError::load_failed(&name, format!("scratch dir: {}", e)))?;

        let binary_path = scratch.path().join("plugin");
        write_executable(&binary_path, binary)
            .await
            .map_err(|e| FunctionError::load_failed(&name, format!("writing binary: {}", e)))?;

        let mut child = Command::new(&binary_path)
            .env(COOKIE_ENV, COOKIE_VALUE)
            .env(SOCKET_DIR_ENV, scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FunctionError::load_failed(&name, format!("spawn: {}", e)))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut stdout = BufReader::new(stdout).lines();

        let line = match tokio::time::timeout(self.config.handshake_timeout, stdout.next_line())
            .await
        {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                reap(child).await;
                return Err(FunctionError::load_failed(
                    &name,
                    "plugin exited before the handshake",
                ));
            }
            Ok(Err(e)) => {
                reap(child).await;
                return Err(FunctionError::load_failed(
                    &name,
                    format!("reading handshake: {}", e),
                ));
            }
            Err(_) => {
                reap(child).await;
                return Err(FunctionError::load_failed(
                    &name,
                    format!(
                        "handshake timed out after {:?}",
                        self.config.handshake_timeout
                    ),
                ));
            }
        };

        let handshake = match Handshake::parse(&line) {
            Ok(handshake) => handshake,
            Err(e) => {
                reap(child).await;
                return Err(FunctionError::load_failed(&name, e.to_string()));
            }
        };

        let stream = match UnixStream::connect(&handshake.address).await {
            Ok(stream) => stream,
            Err(e) => {
                reap(child).await;
                return Err(FunctionError::load_failed(
                    &name,
                    format!("dialing {}: {}", handshake.address, e),
                ));
            }
        };

        // Anything the plugin prints after the handshake is log output.
        let log_name = name.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = stdout.next_line().await {
                debug!(plugin = %log_name, "{}", line);
            }
        });
        if let Some(stderr) = child.stderr.take() {
            let log_name = name.clone();
            let mut stderr = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = stderr.next_line().await {
                    debug!(plugin = %log_name, "{}", line);
                }
            });
        }

        info!(plugin = %name, version = %meta.version, "plugin loaded");
        Ok(RemotePlugin {
            name: name.clone(),
            rpc: RpcClient::new(&name, stream),
            child: Mutex::new(Some(child)),
            shutdown_grace: self.config.shutdown_grace,
            _scratch: scratch,
        })
    }
}

async fn write_executable(path: &Path, binary: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, binary).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

/// Kill a child that failed its handshake and collect the exit status.
async fn reap(mut child: Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// A live subprocess-backed plugin. Closing it terminates the child and
/// removes the scratch directory.
pub struct RemotePlugin {
    name: String,
    rpc: RpcClient,
    child: Mutex<Option<Child>>,
    shutdown_grace: Duration,
    _scratch: TempDir,
}

impl std::fmt::Debug for RemotePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePlugin")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RemotePlugin {
    pub fn is_alive(&self) -> bool {
        self.rpc.is_alive()
    }

    pub async fn execute(&self, event: Event) -> FunctionResult<Vec<Event>> {
        self.rpc.call(event).await
    }

    /// SIGTERM the child, wait up to the grace period, then SIGKILL.
    pub async fn close(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Ask nicely first; plugins flush and exit on SIGTERM.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(plugin = %self.name, %status, "plugin exited");
            }
            Ok(Err(e)) => {
                warn!(plugin = %self.name, error = %e, "waiting for plugin exit failed");
            }
            Err(_) => {
                warn!(plugin = %self.name, "plugin ignored SIGTERM; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::KIND_EXTERNAL_PLUGIN;

    fn host_with_timeout(handshake_timeout: Duration) -> PluginHost {
        PluginHost::new(PluginHostConfig {
            handshake_timeout,
            shutdown_grace: Duration::from_millis(500),
        })
    }

    fn meta(name: &str) -> FunctionMeta {
        FunctionMeta::new(name, KIND_EXTERNAL_PLUGIN, "1.0.0")
    }

    #[tokio::test]
    async fn test_load_rejects_garbage_handshake() {
        let host = host_with_timeout(Duration::from_secs(5));
        let script = b"#!/bin/sh\necho not-a-handshake\nsleep 5\n";
        let err = host.load(&meta("garbage"), script).await.unwrap_err();
        assert!(matches!(err, FunctionError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_load_rejects_wrong_cookie_echo() {
        let host = host_with_timeout(Duration::from_secs(5));
        let script =
            b"#!/bin/sh\necho '1|hypha-function|wrong-cookie|unix|/tmp/x.sock|jsonrpc'\nsleep 5\n";
        let err = host.load(&meta("badcookie"), script).await.unwrap_err();
        let FunctionError::LoadFailed { detail, .. } = err else {
            panic!("expected LoadFailed");
        };
        assert!(detail.contains("cookie"));
    }

    #[tokio::test]
    async fn test_load_rejects_version_mismatch() {
        let host = host_with_timeout(Duration::from_secs(5));
        let script = format!(
            "#!/bin/sh\necho '9|hypha-function|{}|unix|/tmp/x.sock|jsonrpc'\nsleep 5\n",
            COOKIE_VALUE
        );
        let err = host
            .load(&meta("badversion"), script.as_bytes())
            .await
            .unwrap_err();
        let FunctionError::LoadFailed { detail, .. } = err else {
            panic!("expected LoadFailed");
        };
        assert!(detail.contains("version"));
    }

    #[tokio::test]
    async fn test_load_times_out_on_silent_plugin() {
        let host = host_with_timeout(Duration::from_millis(200));
        let script = b"#!/bin/sh\nsleep 30\n";
        let err = host.load(&meta("silent"), script).await.unwrap_err();
        let FunctionError::LoadFailed { detail, .. } = err else {
            panic!("expected LoadFailed");
        };
        assert!(detail.contains("timed out"));
    }

    #[tokio::test]
    async fn test_load_reports_immediate_exit() {
        let host = host_with_timeout(Duration::from_secs(5));
        let script = b"#!/bin/sh\nexit 3\n";
        let err = host.load(&meta("flaky"), script).await.unwrap_err();
        let FunctionError::LoadFailed { detail, .. } = err else {
            panic!("expected LoadFailed");
        };
        assert!(detail.contains("exited"));
    }
}
