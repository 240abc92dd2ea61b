//! Framed RPC client over the plugin's unix socket.
//!
//! One connection carries concurrent calls, multiplexed by request id. A
//! reader task resolves completions; if the connection drops, every
//! in-flight call fails with a crash error and the client goes dead for
//! good.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use hypha_core::Event;
use hypha_plugin_sdk::protocol::{read_message, write_message, ExecuteRequest, ExecuteResponse};

use crate::error::{FunctionError, FunctionResult};

type Completion = oneshot::Sender<FunctionResult<Vec<Event>>>;

pub(crate) struct RpcClient {
    function: String,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, Completion>>>,
    requests: mpsc::UnboundedSender<ExecuteRequest>,
    alive: Arc<AtomicBool>,
}

impl RpcClient {
    pub(crate) fn new(function: &str, stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        let pending: Arc<Mutex<HashMap<u64, Completion>>> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (requests, request_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            function.to_string(),
            writer,
            request_rx,
            Arc::clone(&alive),
        ));
        tokio::spawn(read_loop(
            function.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        Self {
            function: function.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            requests,
            alive,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) async fn call(&self, event: Event) -> FunctionResult<Vec<Event>> {
        if !self.is_alive() {
            return Err(FunctionError::PluginCrashed(format!(
                "plugin '{}' is no longer live",
                self.function
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.requests.send(ExecuteRequest { id, event }).is_err() {
            self.pending.lock().remove(&id);
            return Err(FunctionError::PluginCrashed(format!(
                "plugin '{}' transport is closed",
                self.function
            )));
        }

        match rx.await {
            Ok(result) => result,
            // The reader drained pending on connection loss; a dropped
            // sender without a verdict means the same thing.
            Err(_) => Err(FunctionError::PluginCrashed(format!(
                "plugin '{}' died with the call in flight",
                self.function
            ))),
        }
    }
}

async fn write_loop(
    function: String,
    mut writer: OwnedWriteHalf,
    mut requests: mpsc::UnboundedReceiver<ExecuteRequest>,
    alive: Arc<AtomicBool>,
) {
    while let Some(request) = requests.recv().await {
        if let Err(e) = write_message(&mut writer, &request).await {
            warn!(plugin = %function, error = %e, "plugin write failed");
            alive.store(false, Ordering::SeqCst);
            return;
        }
    }
}

async fn read_loop(
    function: String,
    mut reader: OwnedReadHalf,
    pending: Arc<Mutex<HashMap<u64, Completion>>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match read_message::<_, ExecuteResponse>(&mut reader).await {
            Ok(Some(response)) => {
                let completion = pending.lock().remove(&response.id);
                let Some(completion) = completion else {
                    // Caller abandoned the call (deadline); drop the result.
                    debug!(plugin = %function, id = response.id, "late plugin response discarded");
                    continue;
                };
                let result = match response.error {
                    Some(message) => Err(FunctionError::Execution(message)),
                    None => Ok(response.events),
                };
                let _ = completion.send(result);
            }
            Ok(None) => {
                debug!(plugin = %function, "plugin transport reached EOF");
                break;
            }
            Err(e) => {
                warn!(plugin = %function, error = %e, "plugin read failed");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let drained: Vec<Completion> = {
        let mut pending = pending.lock();
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for completion in drained {
        let _ = completion.send(Err(FunctionError::PluginCrashed(format!(
            "plugin '{}' died with the call in flight",
            function
        ))));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Minimal in-test plugin speaking the wire protocol on a socket pair.
    async fn echo_plugin(stream: UnixStream) {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        while let Ok(Some(request)) = read_message::<_, ExecuteRequest>(&mut reader).await {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                let response = if request.event.ty() == "boom" {
                    ExecuteResponse {
                        id: request.id,
                        events: Vec::new(),
                        error: Some("it broke".to_string()),
                    }
                } else {
                    ExecuteResponse {
                        id: request.id,
                        events: vec![request.event],
                        error: None,
                    }
                };
                let mut writer = writer.lock().await;
                let _ = write_message(&mut *writer, &response).await;
            });
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (host_side, plugin_side) = UnixStream::pair().unwrap();
        tokio::spawn(echo_plugin(plugin_side));
        let client = RpcClient::new("echo", host_side);

        let event = Event::builder("r-1", "s", "t").build().unwrap();
        let events = client.call(event).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), "r-1");
    }

    #[tokio::test]
    async fn test_plugin_error_maps_to_execution_error() {
        let (host_side, plugin_side) = UnixStream::pair().unwrap();
        tokio::spawn(echo_plugin(plugin_side));
        let client = RpcClient::new("echo", host_side);

        let event = Event::builder("r-2", "s", "boom").build().unwrap();
        let err = client.call(event).await.unwrap_err();
        assert!(matches!(err, FunctionError::Execution(ref m) if m == "it broke"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_multiplex_on_one_connection() {
        let (host_side, plugin_side) = UnixStream::pair().unwrap();
        tokio::spawn(echo_plugin(plugin_side));
        let client = Arc::new(RpcClient::new("echo", host_side));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let event = Event::builder(format!("m-{}", i), "s", "t").build().unwrap();
                client.call(event).await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let events = task.await.unwrap().unwrap();
            assert_eq!(events[0].id(), format!("m-{}", i));
        }
    }

    #[tokio::test]
    async fn test_connection_loss_fails_in_flight_calls() {
        let (host_side, plugin_side) = UnixStream::pair().unwrap();
        // Plugin that reads one request and hangs up without answering.
        tokio::spawn(async move {
            let (mut reader, _writer) = plugin_side.into_split();
            let _ = read_message::<_, ExecuteRequest>(&mut reader).await;
        });
        let client = RpcClient::new("flaky", host_side);

        let event = Event::builder("r-3", "s", "t").build().unwrap();
        let err = client.call(event).await.unwrap_err();
        assert!(matches!(err, FunctionError::PluginCrashed(_)));
        assert!(!client.is_alive());

        // Later calls fail fast without touching the transport.
        let event = Event::builder("r-4", "s", "t").build().unwrap();
        let err = client.call(event).await.unwrap_err();
        assert!(matches!(err, FunctionError::PluginCrashed(_)));
    }
}
