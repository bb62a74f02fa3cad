//! reconciler CLI: run a controller over recorded changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reconciler::config::{Config, ControllerConfig};
use reconciler::error::BoxError;
use reconciler::source::{Change, ChannelSource, MemoryCache};
use reconciler::telemetry::{TelemetryConfig, init_telemetry};
use reconciler::{Controller, Event, handler_fn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "reconciler", about = "Event-driven reconciliation controller")]
struct Cli {
    /// Controller settings (TOML). Defaults to RECONCILER_* env vars.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines file of changes through a controller
    Replay {
        /// Changes applied after the cache has synced
        file: PathBuf,
        /// Changes loaded before the cache reports synced
        #[arg(long)]
        initial: Option<PathBuf>,
        /// Worker count (overrides the config)
        #[arg(long)]
        threadiness: Option<usize>,
        /// Make the handler fail for this key (repeatable)
        #[arg(long = "fail-key")]
        fail_keys: Vec<String>,
        /// Stop once every change has been processed
        #[arg(long)]
        exit_when_idle: bool,
    },
    /// Print the effective controller configuration
    Config,
}

/// One line of a replay file.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Upsert {
        key: String,
        #[serde(default)]
        object: serde_json::Value,
    },
    Delete {
        key: String,
    },
}

impl From<Record> for Change<serde_json::Value> {
    fn from(record: Record) -> Self {
        match record {
            Record::Upsert { key, object } => Change::upsert(key, object),
            Record::Delete { key } => Change::delete(key),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let controller_config = match cli.config {
        Some(ref path) => ControllerConfig::from_toml_file(path)?,
        None => config.controller.clone(),
    };

    match cli.command {
        Command::Replay {
            file,
            initial,
            threadiness,
            fail_keys,
            exit_when_idle,
        } => {
            let _guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "reconciler".to_string(),
                log_level: config.log_level.clone(),
            })?;
            let mut controller_config = controller_config;
            if let Some(n) = threadiness {
                controller_config.threadiness = n;
            }
            cmd_replay(
                controller_config,
                &file,
                initial.as_deref(),
                fail_keys,
                exit_when_idle,
            )
            .await
        }
        Command::Config => {
            cmd_config(&controller_config);
            Ok(())
        }
    }
}

fn read_changes(path: &Path) -> anyhow::Result<Vec<Change<serde_json::Value>>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let record: Record = serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("{}:{}: {e}", path.display(), n + 1))?;
            Ok(record.into())
        })
        .collect()
}

async fn cmd_replay(
    config: ControllerConfig,
    file: &Path,
    initial: Option<&Path>,
    fail_keys: Vec<String>,
    exit_when_idle: bool,
) -> anyhow::Result<()> {
    let changes = read_changes(file)?;
    let initial = match initial {
        Some(path) => read_changes(path)?,
        None => Vec::new(),
    };

    let cache = Arc::new(MemoryCache::new());
    let (tx, rx) = mpsc::channel(changes.len().max(1));
    let source = ChannelSource::new(Arc::clone(&cache), rx).with_initial(initial);

    let fail_keys: Arc<HashSet<String>> = Arc::new(fail_keys.into_iter().collect());
    let handler = handler_fn(move |event: Event, object: Option<serde_json::Value>| {
        let fail_keys = Arc::clone(&fail_keys);
        async move {
            if fail_keys.contains(&event.key) {
                return Err::<(), BoxError>(format!("configured to fail {}", event.key).into());
            }
            let object = object.map(|o| o.to_string()).unwrap_or_else(|| "-".to_string());
            println!("{:<8} {:<30} {}", event.action, event.key, object);
            Ok(())
        }
    });

    let controller = Arc::new(Controller::new(config, cache, source, handler));

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.stop();
    });

    let feeder = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let total = changes.len();
            for change in changes {
                if tx.send(change).await.is_err() {
                    return;
                }
            }
            info!(total, "all changes sent");
            if !exit_when_idle {
                return;
            }
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let drained = tx.capacity() == tx.max_capacity();
                if drained && controller.is_idle() {
                    controller.stop();
                    return;
                }
            }
        })
    };

    let result = controller.run().await;
    feeder.abort();
    result?;
    Ok(())
}

fn cmd_config(config: &ControllerConfig) {
    println!("Threadiness:      {}", config.threadiness);
    println!("Retry Threshold:  {}", config.retry.retry_threshold);
    println!("Base Backoff:     {:?}", config.retry.base_backoff);
    println!("Max Backoff:      {:?}", config.retry.max_backoff);
    println!("Sync Poll:        {:?}", config.sync_poll_interval);
    println!(
        "Sync Timeout:     {}",
        config
            .sync_timeout
            .map(|t| format!("{t:?}"))
            .unwrap_or("-".to_string())
    );
}
