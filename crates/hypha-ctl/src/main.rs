//! hyphactl - command line interface for a running hyphad.
//!
//! Talks to the daemon's bus gateway: trigger management, function
//! management, and direct invocations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::json;

use hypha_bus::{Bus, RemoteBus};
use hypha_core::Event;
use hypha_runtime::{BucketRegistry, FunctionMeta, FunctionRegistry};
use hypha_trigger::{Trigger, TriggerStore};

#[derive(Parser)]
#[command(name = "hyphactl")]
#[command(about = "Manage triggers and functions on a running hyphad")]
#[command(version)]
struct Cli {
    /// Gateway address of the daemon
    #[arg(short, long, default_value = "127.0.0.1:4910", global = true)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger management
    Trigger {
        #[command(subcommand)]
        action: TriggerCommands,
    },

    /// Function management
    Function {
        #[command(subcommand)]
        action: FunctionCommands,
    },

    /// Invoke a function with an event read from a JSON file
    Invoke {
        /// Function name
        function: String,

        /// Path to the event JSON
        #[arg(short, long)]
        event: PathBuf,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

#[derive(Subcommand)]
enum TriggerCommands {
    /// Add a trigger from a YAML document
    Add {
        /// Path to the trigger YAML
        file: PathBuf,

        /// Namespace the trigger is stored under
        #[arg(long, default_value = "default")]
        namespace: String,

        /// KV bucket holding triggers
        #[arg(long, default_value = "triggers")]
        bucket: String,
    },

    /// List all triggers
    List {
        #[arg(long, default_value = "triggers")]
        bucket: String,
    },

    /// Delete a trigger by id
    Delete {
        /// Trigger id
        id: String,

        #[arg(long, default_value = "default")]
        namespace: String,

        #[arg(long, default_value = "triggers")]
        bucket: String,
    },
}

#[derive(Subcommand)]
enum FunctionCommands {
    /// Store a function's metadata and binary
    Put {
        /// Function name
        name: String,

        /// Function type
        #[arg(long, default_value = "external-plugin")]
        kind: String,

        /// Version label
        #[arg(long, default_value = "0.1.0")]
        version: String,

        /// Path to the plugin binary (omit for builtins)
        #[arg(long)]
        binary: Option<PathBuf>,

        #[arg(long, default_value = "functions")]
        functions_bucket: String,

        #[arg(long, default_value = "function-binaries")]
        binaries_bucket: String,
    },

    /// List registered functions
    List {
        #[arg(long, default_value = "functions")]
        functions_bucket: String,

        #[arg(long, default_value = "function-binaries")]
        binaries_bucket: String,
    },

    /// Delete a function
    Delete {
        /// Function name
        name: String,

        #[arg(long, default_value = "functions")]
        functions_bucket: String,

        #[arg(long, default_value = "function-binaries")]
        binaries_bucket: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let bus = RemoteBus::connect(&cli.server)
        .await
        .with_context(|| format!("connecting to hyphad at {}", cli.server))?;

    match cli.command {
        Commands::Trigger { action } => trigger_command(&bus, action).await,
        Commands::Function { action } => function_command(&bus, action).await,
        Commands::Invoke {
            function,
            event,
            timeout_secs,
        } => invoke_command(&bus, &function, &event, timeout_secs).await,
    }
}

async fn trigger_command(bus: &RemoteBus, action: TriggerCommands) -> anyhow::Result<()> {
    match action {
        TriggerCommands::Add {
            file,
            namespace,
            bucket,
        } => {
            let document = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let trigger = Trigger::from_yaml(&document).context("parsing trigger document")?;
            let store = TriggerStore::open(bus, &bucket).await?;
            store.save(&namespace, &trigger).await?;
            println!("Trigger '{}' added", trigger.id);
        }
        TriggerCommands::List { bucket } => {
            let store = TriggerStore::open(bus, &bucket).await?;
            store.load_all().await?;
            let triggers = store.all_triggers();
            if triggers.is_empty() {
                println!("No triggers found");
                return Ok(());
            }
            for t in triggers {
                println!("\nTrigger: {}", t.name);
                println!("  ID: {}", t.id);
                println!("  Namespaces: {:?}", t.namespaces);
                println!("  Event Type: {}", t.event_type);
                println!("  Object Type: {}", t.object_type);
                println!("  Criteria: {}", t.criteria);
                println!("  Action: {}", t.action);
                println!("  Enabled: {}", t.enabled);
            }
        }
        TriggerCommands::Delete {
            id,
            namespace,
            bucket,
        } => {
            let store = TriggerStore::open(bus, &bucket).await?;
            store.delete(&namespace, &id).await?;
            println!("Trigger '{}' deleted", id);
        }
    }
    Ok(())
}

async fn function_command(bus: &RemoteBus, action: FunctionCommands) -> anyhow::Result<()> {
    match action {
        FunctionCommands::Put {
            name,
            kind,
            version,
            binary,
            functions_bucket,
            binaries_bucket,
        } => {
            let bytes = match binary {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => Vec::new(),
            };
            let registry =
                BucketRegistry::open(bus as &dyn Bus, &functions_bucket, &binaries_bucket).await?;
            registry
                .store(FunctionMeta::new(&name, &kind, &version), Bytes::from(bytes))
                .await?;
            println!("Function '{}' stored", name);
        }
        FunctionCommands::List {
            functions_bucket,
            binaries_bucket,
        } => {
            let registry =
                BucketRegistry::open(bus as &dyn Bus, &functions_bucket, &binaries_bucket).await?;
            let functions = registry.list().await?;
            if functions.is_empty() {
                println!("No functions found");
                return Ok(());
            }
            for meta in functions {
                println!("{}  type={}  version={}", meta.name, meta.kind, meta.version);
            }
        }
        FunctionCommands::Delete {
            name,
            functions_bucket,
            binaries_bucket,
        } => {
            let registry =
                BucketRegistry::open(bus as &dyn Bus, &functions_bucket, &binaries_bucket).await?;
            registry.delete(&name).await?;
            println!("Function '{}' deleted", name);
        }
    }
    Ok(())
}

async fn invoke_command(
    bus: &RemoteBus,
    function: &str,
    event_path: &std::path::Path,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let raw = std::fs::read(event_path)
        .with_context(|| format!("reading {}", event_path.display()))?;
    let event = Event::from_json(&raw).context("parsing event")?;

    let envelope = json!({
        "functionName": function,
        "event": event,
    });
    let reply = bus
        .request(
            "function.invoke",
            Bytes::from(serde_json::to_vec(&envelope)?),
            Duration::from_secs(timeout_secs),
        )
        .await
        .context("invoking function")?;

    let reply: serde_json::Value = serde_json::from_slice(&reply).context("decoding reply")?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    if reply.get("errorType").is_some() {
        bail!("invocation returned {}", reply["errorType"]);
    }
    Ok(())
}
