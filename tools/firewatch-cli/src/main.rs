//! Command-line host for the Firewatch offline worker.
//!
//! Each invocation plays the host for one event: it loads the worker
//! configuration, opens the persistent store, resumes the worker if the
//! current store generation already exists, dispatches the event and prints
//! the outcome as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Populate the store and take over
//! firewatch activate
//!
//! # Serve a request through the worker
//! firewatch fetch http://localhost:8080/index.html
//! firewatch fetch http://localhost:8080/incidents/42 --document
//!
//! # Show a notification, then click it
//! firewatch push '{"title":"Fire","body":"Engine 3 dispatched"}'
//! firewatch click view
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use firewatch_core::{init_logging, LogConfig, LogFormat, WorkerConfig};
use firewatch_net::{HttpFetcher, LoaderConfig, Request};
use firewatch_sw::{
    CacheStorage, ClickOutcome, EventOutcome, OfflineWorker, RecordingSink, ServiceWorkerEvent,
    SqliteBackend, SyncOutcome, WorkerEvent,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "firewatch")]
#[command(about = "Drive the Firewatch offline worker from the command line")]
struct Cli {
    /// Worker configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Keep the store in memory instead of on disk
    #[arg(long, global = true, conflicts_with = "db")]
    memory: bool,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Log filter, e.g. "firewatch_sw=debug"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    /// Debug logging with source locations and span events
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Exit without waiting for background cache writes; they are dropped
    #[arg(long, global = true)]
    no_wait: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Populate the current store from the asset manifest
    Install,

    /// Install, then activate and collect old store generations
    Activate,

    /// Serve a request through the worker
    Fetch {
        /// Request URL
        url: Url,
        /// Treat the request as a page navigation
        #[arg(long)]
        document: bool,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// Deliver a push message
    Push {
        /// JSON payload; omit for a push without data
        payload: Option<String>,
    },

    /// Show a notification and click one of its actions
    Click {
        /// Action id (view, dismiss); omit to click the notification body
        action: Option<String>,
        /// JSON payload of the clicked notification
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Fire a background sync tag
    Sync {
        /// Sync tag
        tag: String,
    },

    /// List stores and their entries
    Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(log_config(&cli))?;

    let config = WorkerConfig::load(cli.config.as_deref()).map_err(|e| {
        error!(category = e.category(), error = %e, "Failed to load worker configuration");
        e
    })?;
    let config = Arc::new(config);
    let caches = open_caches(cli.memory, cli.db.as_deref())?;

    let fetcher = HttpFetcher::new(&config.scope, LoaderConfig::default())?;
    let sink = Arc::new(RecordingSink::new());
    let (worker, mut events) =
        OfflineWorker::new(Arc::clone(&config), Arc::new(fetcher), caches, sink);

    let output = match cli.command {
        Commands::Install => {
            let report = worker.install().await?;
            json!({ "cache": report.cache_name, "entries": report.entries })
        }

        Commands::Activate => {
            let report = worker.start().await?;
            json!({
                "current": report.current,
                "deleted": report.deleted,
                "failed": report.failed,
            })
        }

        Commands::Fetch {
            url,
            document,
            body,
        } => {
            resume(&worker).await?;
            let request = if document {
                Request::navigate(url)
            } else {
                Request::get(url)
            };

            let response = worker.handle_fetch(request).await?;
            let mut out = json!({
                "status": response.status.as_u16(),
                "statusText": response.status_text(),
                "type": response.response_type,
                "contentType": response.content_type().map(|m| m.to_string()),
                "bytes": response.bytes().len(),
            });
            if body {
                out["body"] = Value::String(String::from_utf8_lossy(response.bytes()).into_owned());
            }
            out
        }

        Commands::Push { payload } => {
            let outcome = worker
                .dispatch(WorkerEvent::Push(payload.map(Bytes::from)))
                .await?;
            match outcome {
                EventOutcome::Push(notification) => serde_json::to_value(notification)?,
                other => bail!("unexpected outcome {:?}", other),
            }
        }

        Commands::Click { action, payload } => {
            resume(&worker).await?;
            let EventOutcome::Push(Some(notification)) = worker
                .dispatch(WorkerEvent::Push(Some(Bytes::from(payload))))
                .await?
            else {
                bail!("payload did not produce a notification");
            };

            let outcome = worker
                .dispatch(WorkerEvent::NotificationClick {
                    notification,
                    action,
                })
                .await?;
            match outcome {
                EventOutcome::Click(click) => click_json(&click),
                other => bail!("unexpected outcome {:?}", other),
            }
        }

        Commands::Sync { tag } => match worker.dispatch(WorkerEvent::Sync { tag }).await? {
            EventOutcome::Sync(SyncOutcome::Completed) => json!({ "sync": "completed" }),
            EventOutcome::Sync(SyncOutcome::Ignored) => json!({ "sync": "ignored" }),
            other => bail!("unexpected outcome {:?}", other),
        },

        Commands::Caches => list_caches(worker.caches()).await?,
    };

    if cli.no_wait {
        worker.abort();
    } else {
        let settled = worker.idle().await;
        debug!(settled, "Background work finished");
    }

    print_json(&json!({
        "result": output,
        "effects": drain_effects(&mut events),
    }))
}

fn log_config(cli: &Cli) -> LogConfig {
    let config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default().with_filter("warn")
    };
    let config = config.with_format(cli.log_format);
    match &cli.log_filter {
        Some(filter) => config.with_filter(filter.clone()),
        None => config,
    }
}

/// Open the store set, on disk unless `memory` is set.
fn open_caches(memory: bool, db: Option<&Path>) -> Result<CacheStorage> {
    if memory {
        return Ok(CacheStorage::in_memory());
    }

    let path = match db {
        Some(path) => path.to_path_buf(),
        None => SqliteBackend::default_path().context("no data directory for the cache database")?,
    };
    let backend = SqliteBackend::open(&path)
        .with_context(|| format!("failed to open cache database {}", path.display()))?;
    Ok(CacheStorage::new(Arc::new(backend)))
}

async fn resume(worker: &OfflineWorker) -> Result<()> {
    if worker.resume().await? {
        info!(cache = %worker.config().cache_name(), "Worker resumed");
    } else {
        info!("No populated store, requests pass through to the network");
    }
    Ok(())
}

async fn list_caches(caches: &CacheStorage) -> Result<Value> {
    let mut stores = Vec::new();
    for name in caches.keys().await? {
        let keys = caches.open(&name).await?.keys().await?;
        stores.push(json!({
            "name": name,
            "entries": keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }));
    }
    Ok(Value::Array(stores))
}

fn click_json(click: &ClickOutcome) -> Value {
    match click {
        ClickOutcome::Opened { client_id, url } => {
            json!({ "click": "opened", "client": client_id, "url": url })
        }
        ClickOutcome::Focused { client_id } => json!({ "click": "focused", "client": client_id }),
        ClickOutcome::Closed => json!({ "click": "closed" }),
    }
}

fn drain_effects(events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<Value> {
    let mut effects = Vec::new();
    while let Ok(event) = events.try_recv() {
        effects.push(match event {
            ServiceWorkerEvent::StateChange {
                worker_id,
                new_state,
            } => json!({ "stateChange": { "worker": worker_id.to_string(), "state": new_state } }),
            ServiceWorkerEvent::ControllerChange { client_id } => {
                json!({ "controllerChange": client_id })
            }
            ServiceWorkerEvent::OpenWindow { client_id, url } => {
                json!({ "openWindow": { "client": client_id, "url": url } })
            }
            ServiceWorkerEvent::Focus { client_id } => json!({ "focus": client_id }),
        });
    }
    effects
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
