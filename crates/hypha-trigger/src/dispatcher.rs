//! The event dispatcher.
//!
//! Consumes the durable event stream, matches each event against the
//! trigger index, and invokes the matched actions on the runtime service.
//! Per-trigger failures (criteria errors, invocation failures) are logged
//! and counted but never poison other triggers or block acknowledgment;
//! only an undecodable payload or a handler panic produces a negative
//! acknowledgment. Every consumed message gets exactly one ack-or-nak.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use metrics::counter;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hypha_bus::{Bus, ConsumerConfig, DeliverPolicy, StreamMessage};
use hypha_core::Event;

use crate::error::{TriggerError, TriggerResult};
use crate::matcher::match_trigger;
use crate::store::TriggerStore;
use crate::types::Trigger;

/// Consumer and invocation settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Stream to consume.
    pub stream: String,
    /// Subject filter bound to the stream.
    pub subject: String,
    /// Durable consumer name; instances sharing it form a load-balancing
    /// group.
    pub durable_name: String,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    /// Subject the runtime service answers on.
    pub invoke_subject: String,
    /// Per-action invocation deadline.
    pub invoke_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            stream: "events".to_string(),
            subject: "event.>".to_string(),
            durable_name: "hypha-dispatcher".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            invoke_subject: "function.invoke".to_string(),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    store: Arc<TriggerStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn Bus>, store: Arc<TriggerStore>, config: DispatcherConfig) -> Self {
        Self { bus, store, config }
    }

    /// Consume until `shutdown` flips. Creates the stream and the durable
    /// consumer on first use.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> TriggerResult<()> {
        self.bus
            .create_stream(&self.config.stream, &[self.config.subject.clone()])
            .await?;
        let consumer = self
            .bus
            .consumer(
                &self.config.stream,
                ConsumerConfig {
                    durable_name: self.config.durable_name.clone(),
                    deliver_policy: DeliverPolicy::New,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                },
            )
            .await?;
        info!(
            stream = %self.config.stream,
            subject = %self.config.subject,
            durable = %self.config.durable_name,
            "dispatcher consuming"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }
                message = consumer.next() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    self.handle(message).await;
                }
            }
        }
    }

    /// Process one delivery and settle it exactly once.
    async fn handle(&self, message: StreamMessage) {
        counter!("hypha_dispatch_events_total").increment(1);

        let outcome = AssertUnwindSafe(self.process(&message)).catch_unwind().await;
        let settle = match outcome {
            Ok(Ok(())) => message.ack().await,
            Ok(Err(e)) => {
                warn!(
                    subject = %message.subject,
                    sequence = message.sequence,
                    error = %e,
                    "dispatch failed; message will redeliver"
                );
                message.nak().await
            }
            Err(_) => {
                error!(
                    subject = %message.subject,
                    sequence = message.sequence,
                    "dispatch handler panicked; message will redeliver"
                );
                message.nak().await
            }
        };
        if let Err(e) = settle {
            warn!(sequence = message.sequence, error = %e, "failed to settle stream message");
        }
    }

    async fn process(&self, message: &StreamMessage) -> TriggerResult<()> {
        let event =
            Event::from_json(&message.payload).map_err(|e| TriggerError::Decode(e.to_string()))?;

        let candidates = self.store.get_triggers(event.source());
        debug!(
            event = %event.id(),
            namespace = %event.source(),
            candidates = candidates.len(),
            "matching event"
        );

        for trigger in candidates {
            match match_trigger(&trigger, &event) {
                Ok(true) => {
                    counter!("hypha_trigger_matches_total", "trigger" => trigger.id.clone())
                        .increment(1);
                    self.invoke(&trigger, &event).await;
                }
                Ok(false) => {}
                Err(e) => {
                    // A broken criteria skips its trigger, nothing else.
                    counter!("hypha_criteria_errors_total", "trigger" => trigger.id.clone())
                        .increment(1);
                    warn!(trigger = %trigger.id, error = %e, "criteria evaluation failed");
                }
            }
        }
        Ok(())
    }

    /// Invoke the trigger's action. Failures are logged but do not prevent
    /// acknowledgment; delivery to the action is at-least-once.
    async fn invoke(&self, trigger: &Trigger, event: &Event) {
        let body = json!({
            "functionName": trigger.action,
            "event": event,
        });
        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(trigger = %trigger.id, error = %e, "failed to encode invocation");
                return;
            }
        };

        match self
            .bus
            .request(
                &self.config.invoke_subject,
                Bytes::from(payload),
                self.config.invoke_timeout,
            )
            .await
        {
            Ok(reply) => {
                match serde_json::from_slice::<serde_json::Value>(&reply) {
                    Ok(reply) if reply.get("errorType").is_some() => {
                        counter!("hypha_trigger_invoke_failures_total", "trigger" => trigger.id.clone())
                            .increment(1);
                        warn!(
                            trigger = %trigger.id,
                            action = %trigger.action,
                            error = %reply["error"],
                            error_type = %reply["errorType"],
                            "action invocation returned an error"
                        );
                    }
                    _ => {
                        debug!(trigger = %trigger.id, action = %trigger.action, "action invoked");
                    }
                }
            }
            Err(e) => {
                counter!("hypha_trigger_invoke_failures_total", "trigger" => trigger.id.clone())
                    .increment(1);
                warn!(
                    trigger = %trigger.id,
                    action = %trigger.action,
                    error = %e,
                    "action invocation failed"
                );
            }
        }
    }
}
