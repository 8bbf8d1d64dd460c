//! TrancheTrader - Main Entry Point
//!
//! Loads configuration, wires the gateway, feed and engine together and
//! runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tranche_trader::broker::build_gateway;
use tranche_trader::common::channels::create_shutdown_channel;
use tranche_trader::common::traits::AlertSink;
use tranche_trader::config::load_config;
use tranche_trader::config::types::BrokerMode;
use tranche_trader::notify::{LogSink, Notifier, WebhookSink};
use tranche_trader::{CandidateBuffer, CandidateFeed, Store, TradingEngine};

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "TRADER_CONFIG")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Trade against the in-memory paper account regardless of config
    #[arg(long)]
    paper: bool,
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let mut config = load_config(Some(&args.config)).context("loading configuration")?;
    if args.paper {
        config.broker.mode = BrokerMode::Paper;
    }
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.settings.log_level.clone());
    init_tracing(&level, args.json_logs || config.settings.json_logs)?;

    info!("Starting TrancheTrader");
    info!("Configuration file: {}", args.config);

    let store = match &config.database {
        Some(db) => Store::connect(db).await?,
        None => {
            warn!("No database configured, using in-memory storage");
            Store::in_memory().await?
        }
    };
    let overrides = store.get_settings().await?;
    if !overrides.is_empty() {
        config
            .apply_overrides(&overrides)
            .context("applying stored settings")?;
        info!(count = overrides.len(), "Applied stored settings");
    }

    let sink: Arc<dyn AlertSink> = match WebhookSink::from_config(&config.notify)? {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(LogSink),
    };
    let (notifier, dispatcher) = Notifier::spawn(config.notify.queue_size, sink);

    let gateway = build_gateway(&config.broker)?;
    let buffer = CandidateBuffer::new(
        config.feed.buffer_capacity,
        chrono::Duration::seconds(i64::try_from(config.feed.candidate_max_age_secs).unwrap_or(60)),
    );
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let feed_task = if config.feed.enabled {
        let feed = CandidateFeed::new(config.feed.clone(), gateway.clone(), buffer.clone());
        Some(feed.spawn(shutdown_rx.clone()))
    } else {
        info!("Candidate feed disabled");
        None
    };

    let engine = Arc::new(TradingEngine::new(
        config.clone(),
        gateway,
        buffer,
        Some(store),
        Some(notifier.clone()),
    )?);
    engine.restore().await?;

    let engine_task = {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };
    notifier.info(format!("TrancheTrader started ({:?} broker)", config.broker.mode));

    info!("Application initialized successfully");

    // Keep the application running
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, cleaning up...");

    shutdown_tx.send(true).ok();
    if let Some(task) = feed_task {
        task.await.ok();
    }
    engine_task.await.ok();
    engine.shutdown().await;

    notifier.info("TrancheTrader stopped");
    drop(notifier);
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(config.notify.timeout_secs.max(1)), dispatcher)
        .await
        .is_err()
    {
        warn!("Alert dispatcher did not finish in time");
    }

    Ok(())
}
