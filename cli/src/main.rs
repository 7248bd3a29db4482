//! CisIndex CLI: runs the CIS-2 indexer and manages its state.
//!
//! # Commands
//! ```text
//! cisindex run     --node-url <url> [--net mainnet|testnet] [--config <file.json>]
//! cisindex status
//! cisindex rescan  --heights 120 121 4400
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cisindex_cis::Net;
use cisindex_core::checkpoint::{CheckpointManager, Stage};
use cisindex_core::store::{Collection, Document, DocumentStore};
use cisindex_pipeline::records::SpecialPurposeRequest;
use cisindex_pipeline::{HeartbeatBuilder, HeartbeatConfig, HttpNodeClient, HttpNodeConfig, WebhookNotifier};
use cisindex_storage::{InMemoryStore, SqliteStore};

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "cisindex",
    about = "CIS-2 token event indexer",
    long_about = "
CisIndex: ingests finalized blocks, extracts CIS-2 token events and keeps
token supply, balances and transfer memos up to date in a document store.

ENVIRONMENT VARIABLES:
  CISINDEX_NODE_URL        JSON-RPC node gateway URL
  CISINDEX_NET             mainnet | testnet
  CISINDEX_STORE           \"memory\" or a SQLite database path
  CISINDEX_CONFIG          JSON file with heartbeat settings
  CISINDEX_NOTIFY_WEBHOOK  URL receiving failure alerts
  CISINDEX_LOG_LEVEL       trace | debug | info | warn | error
  CISINDEX_LOG_JSON        emit JSON logs when true
",
    version
)]
struct Cli {
    /// Document store: "memory" or a SQLite path
    #[arg(long, env = "CISINDEX_STORE", default_value = "memory", global = true)]
    store: String,

    /// Global log level
    #[arg(long, env = "CISINDEX_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Per-crate log level, e.g. cisindex_pipeline=debug (repeatable)
    #[arg(long = "log", global = true)]
    log_components: Vec<String>,

    /// Emit JSON structured logs
    #[arg(long, env = "CISINDEX_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexer until Ctrl-C
    Run {
        /// JSON-RPC node gateway
        #[arg(long, env = "CISINDEX_NODE_URL")]
        node_url: String,
        /// Network (overrides the config file)
        #[arg(long, env = "CISINDEX_NET")]
        net: Option<String>,
        /// JSON file with heartbeat settings
        #[arg(long, env = "CISINDEX_CONFIG")]
        config: Option<String>,
        /// First height when no checkpoint exists (overrides the config file)
        #[arg(long)]
        start_height: Option<u64>,
        /// URL receiving failure alerts as JSON
        #[arg(long, env = "CISINDEX_NOTIFY_WEBHOOK")]
        notify_webhook: Option<String>,
    },

    /// Print the persisted checkpoint of every stage
    Status,

    /// Ask a running indexer to re-scan heights in special-purpose mode
    Rescan {
        #[arg(long, num_args = 1.., required = true)]
        heights: Vec<u64>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..Default::default()
    }
    .with_overrides(&cli.log_components)?;
    init_tracing(&log);

    let store = open_store(&cli.store).await?;
    match cli.command {
        Commands::Run {
            node_url,
            net,
            config,
            start_height,
            notify_webhook,
        } => {
            let config = load_config(config.as_deref(), net.as_deref(), start_height)?;
            cmd_run(store, &node_url, config, notify_webhook).await
        }
        Commands::Status => cmd_status(store.as_ref()).await,
        Commands::Rescan { heights } => cmd_rescan(store.as_ref(), heights).await,
    }
}

async fn open_store(location: &str) -> Result<Arc<dyn DocumentStore>> {
    if location == "memory" {
        tracing::warn!("using the in-memory store; nothing survives a restart");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let store = SqliteStore::open(location)
        .await
        .with_context(|| format!("opening SQLite store {location}"))?;
    Ok(Arc::new(store))
}

fn load_config(path: Option<&str>, net: Option<&str>, start_height: Option<u64>) -> Result<HeartbeatConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
            HeartbeatConfig::from_json(&text).with_context(|| format!("parsing config {path}"))?
        }
        None => HeartbeatConfig::default(),
    };
    if let Some(net) = net {
        config.net = net.parse::<Net>().context("invalid --net")?;
    }
    if let Some(height) = start_height {
        config.start_height = height;
    }
    Ok(config)
}

async fn cmd_run(
    store: Arc<dyn DocumentStore>,
    node_url: &str,
    config: HeartbeatConfig,
    notify_webhook: Option<String>,
) -> Result<()> {
    let node = HttpNodeClient::new(
        node_url,
        HttpNodeConfig {
            retry: config.node_retry.clone(),
            ..Default::default()
        },
    )
    .context("building node client")?;

    let mut builder = HeartbeatBuilder::new()
        .config(config)
        .node(Arc::new(node))
        .store(store);
    if let Some(url) = notify_webhook {
        let notifier = WebhookNotifier::new(url).context("building webhook notifier")?;
        builder = builder.notifier(Arc::new(notifier));
    }
    let heartbeat = builder.build().context("invalid heartbeat configuration")?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl-C received; shutting down"),
            Err(e) => tracing::error!(error = %e, "cannot listen for Ctrl-C; shutting down"),
        }
        trigger.cancel();
    });

    tracing::info!(node = node_url, "cisindex {} starting", env!("CARGO_PKG_VERSION"));
    heartbeat.run(shutdown).await.context("heartbeat failed")?;
    Ok(())
}

async fn cmd_status(store: &dyn DocumentStore) -> Result<()> {
    for stage in [Stage::Heartbeat, Stage::TokenAccounting, Stage::Memos] {
        let height = CheckpointManager::load_stage(store, stage)
            .await
            .with_context(|| format!("reading {}", stage.checkpoint_id()))?;
        match height {
            Some(h) => println!("{:<45} {h}", stage.checkpoint_id()),
            None => println!("{:<45} -", stage.checkpoint_id()),
        }
    }
    let pending = store
        .find_one(Collection::Helpers, SpecialPurposeRequest::ID)
        .await?
        .map(|doc| doc.into_record::<SpecialPurposeRequest>())
        .transpose()?
        .map_or(0, |request| request.heights.len());
    println!("{:<45} {pending}", "special_purpose_blocks (pending)");
    Ok(())
}

async fn cmd_rescan(store: &dyn DocumentStore, heights: Vec<u64>) -> Result<()> {
    let mut request = match store.find_one(Collection::Helpers, SpecialPurposeRequest::ID).await? {
        Some(doc) => doc.into_record::<SpecialPurposeRequest>()?,
        None => SpecialPurposeRequest::new(vec![]),
    };
    request.heights.extend(heights);
    request.heights.sort_unstable();
    request.heights.dedup();
    store
        .replace_one(Collection::Helpers, Document::from_record(&request)?)
        .await
        .context("writing special-purpose request")?;
    println!("{} height(s) queued for re-scan", request.heights.len());
    Ok(())
}
