//! Hypha daemon.
//!
//! Runs the embedded bus with its TCP gateway, the function runtime
//! service, and the trigger dispatcher in one process:
//!
//! ```text
//!   # defaults: gateway on 127.0.0.1:4910, service "function-runtime"
//!   hyphad
//!
//!   # tuned consumer settings
//!   hyphad --ack-wait-secs 10 --max-deliver 5 --log-level debug
//! ```
//!
//! Loss of the dispatcher's stream (the embedded analogue of losing the
//! bus connection) is fatal: the daemon stops serving and exits non-zero.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hypha_bus::gateway::Gateway;
use hypha_bus::{Bus, MemoryBus};
use hypha_core::RuntimeConfig;
use hypha_runtime::{
    BucketRegistry, BuiltinCatalog, PluginCache, PluginHost, RuntimeService, RuntimeServiceConfig,
};
use hypha_trigger::{Dispatcher, DispatcherConfig, TriggerStore};

#[derive(Parser, Debug)]
#[command(name = "hyphad")]
#[command(about = "Hypha - serverless function runtime on a message bus")]
#[command(version)]
struct Cli {
    /// Address the bus gateway listens on
    #[arg(long, default_value = "127.0.0.1:4910")]
    listen: String,

    /// Service name advertised on the bus
    #[arg(long, default_value = "function-runtime")]
    service_name: String,

    /// KV bucket holding function metadata
    #[arg(long, default_value = "functions")]
    functions_bucket: String,

    /// Object bucket holding function binaries
    #[arg(long, default_value = "function-binaries")]
    binaries_bucket: String,

    /// KV bucket holding triggers
    #[arg(long, default_value = "triggers")]
    triggers_bucket: String,

    /// Stream the dispatcher consumes
    #[arg(long, default_value = "events")]
    stream: String,

    /// Subject filter bound to the event stream
    #[arg(long, default_value = "event.>")]
    subject: String,

    /// Durable consumer name
    #[arg(long, default_value = "hypha-dispatcher")]
    durable: String,

    /// Seconds a delivery may stay unacknowledged before redelivery
    #[arg(long, default_value = "30")]
    ack_wait_secs: u64,

    /// Delivery attempts per message
    #[arg(long, default_value = "3")]
    max_deliver: u32,

    /// Ceiling in seconds for invocations without a client deadline
    #[arg(long, default_value = "30")]
    invoke_deadline_secs: u64,

    /// Grace period in seconds for in-flight work during shutdown
    #[arg(long, default_value = "10")]
    shutdown_grace_secs: u64,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            service_name: self.service_name.clone(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            functions_bucket: self.functions_bucket.clone(),
            binaries_bucket: self.binaries_bucket.clone(),
            triggers_bucket: self.triggers_bucket.clone(),
            event_stream: self.stream.clone(),
            event_subject: self.subject.clone(),
            durable_name: self.durable.clone(),
            ack_wait: Duration::from_secs(self.ack_wait_secs),
            max_deliver: self.max_deliver,
            invoke_deadline: Duration::from_secs(self.invoke_deadline_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.runtime_config();
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    bus.create_stream(&config.event_stream, &[config.event_subject.clone()])
        .await?;
    let gateway = Gateway::bind(&cli.listen, Arc::clone(&bus)).await?;

    // Runtime service.
    let registry = Arc::new(
        BucketRegistry::open(&*bus, &config.functions_bucket, &config.binaries_bucket).await?,
    );
    let cache = Arc::new(PluginCache::new(
        registry,
        Arc::new(BuiltinCatalog::with_defaults()),
        Arc::new(PluginHost::default()),
    ));
    let service = RuntimeService::new(
        Arc::clone(&bus),
        cache,
        RuntimeServiceConfig {
            name: config.service_name.clone(),
            version: config.service_version.clone(),
            description: config.service_description.clone(),
            invoke_deadline: config.invoke_deadline,
            shutdown_grace: config.shutdown_grace,
        },
    );
    service.start().await?;

    // Trigger dispatcher.
    let store = TriggerStore::open(&*bus, &config.triggers_bucket).await?;
    store.load_all().await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watch_task = store.start_watch(shutdown_rx.clone()).await?;

    let dispatcher = Dispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        DispatcherConfig {
            stream: config.event_stream.clone(),
            subject: config.event_subject.clone(),
            durable_name: config.durable_name.clone(),
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            invoke_timeout: config.invoke_deadline,
            ..Default::default()
        },
    );
    let dispatcher_shutdown = shutdown_rx.clone();
    let mut dispatcher_task =
        tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });

    info!(
        gateway = %gateway.local_addr(),
        service = %config.service_name,
        "hyphad ready"
    );

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping");
        }
        result = &mut dispatcher_task => {
            // The dispatcher only returns on its own when the stream is
            // gone; without a bus there is nothing left to serve.
            match result {
                Ok(Ok(())) => error!("dispatcher lost its stream"),
                Ok(Err(e)) => error!(error = %e, "dispatcher failed"),
                Err(e) => error!(error = %e, "dispatcher task panicked"),
            }
            let _ = shutdown_tx.send(true);
            service.stop().await;
            gateway.stop().await;
            std::process::exit(1);
        }
    }

    let _ = shutdown_tx.send(true);
    service.stop().await;
    if let Err(e) = tokio::time::timeout(config.shutdown_grace, &mut dispatcher_task).await {
        error!(error = %e, "dispatcher did not stop in time");
        dispatcher_task.abort();
    }
    watch_task.abort();
    gateway.stop().await;

    info!("goodbye");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
