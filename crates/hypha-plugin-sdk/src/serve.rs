//! Plugin-side serve loop.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use hypha_core::Event;

use crate::protocol::{
    read_message, write_message, ExecuteRequest, ExecuteResponse, Handshake, COOKIE_ENV,
    COOKIE_VALUE, SOCKET_DIR_ENV,
};

/// A function hosted by a plugin executable.
#[async_trait]
pub trait Function: Send + Sync {
    /// Process the incoming event and return zero or more derived events.
    async fn execute(&self, event: Event) -> anyhow::Result<Vec<Event>>;
}

/// Run the plugin protocol for `function`. Never returns under normal
/// operation; the host ends the process when it is done with the plugin.
pub async fn serve<F: Function + 'static>(function: F) -> anyhow::Result<()> {
    match std::env::var(COOKIE_ENV) {
        Ok(cookie) if cookie == COOKIE_VALUE => {}
        _ => bail!(
            "this binary is a hypha function plugin and cannot run standalone; \
             it must be launched by the function runtime"
        ),
    }

    let dir = std::env::var_os(SOCKET_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let socket_path = dir.join(format!("hypha-plugin-{}.sock", std::process::id()));
    // A previous instance with the same pid may have left the file behind.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding plugin socket {}", socket_path.display()))?;

    let line = Handshake::for_address(socket_path.display().to_string()).to_line();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", line).context("writing handshake")?;
    stdout.flush().context("flushing handshake")?;

    let function = Arc::new(function);
    loop {
        let (stream, _) = listener.accept().await.context("accepting host dial")?;
        let function = Arc::clone(&function);
        tokio::spawn(async move {
            if let Err(e) = connection(stream, function).await {
                tracing::error!(error = %e, "plugin connection failed");
            }
        });
    }
}

async fn connection<F: Function + 'static>(
    stream: UnixStream,
    function: Arc<F>,
) -> anyhow::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    while let Some(request) = read_message::<_, ExecuteRequest>(&mut reader).await? {
        let function = Arc::clone(&function);
        let writer = Arc::clone(&writer);
        // Calls run concurrently; ordering across in-flight calls is the
        // host's concern, correlation happens by id.
        tokio::spawn(async move {
            let id = request.id;
            let response = match function.execute(request.event).await {
                Ok(events) => ExecuteResponse {
                    id,
                    events,
                    error: None,
                },
                Err(e) => ExecuteResponse {
                    id,
                    events: Vec::new(),
                    error: Some(format!("{:#}", e)),
                },
            };
            let mut writer = writer.lock().await;
            if let Err(e) = write_message(&mut *writer, &response).await {
                tracing::error!(error = %e, id, "failed to write plugin response");
            }
        });
    }
    Ok(())
}
