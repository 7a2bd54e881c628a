//! Herald CLI entry point.
//!
//! Provides `serve`, `reconcile`, `enqueue`, and `list` subcommands for
//! running the delivery service, settling stranded messages once, queueing
//! a message, or dumping the sent-message log.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use herald::api::{self, AppState};
use herald::cache::{RecordCache, RedisRecordCache};
use herald::config::HeraldConfig;
use herald::delivery::{DeliveryControl, DeliveryEngine};
use herald::reconcile::Reconciler;
use herald::sender::WebhookSender;
use herald::store::SqliteMessageStore;

/// Herald: crash-safe webhook delivery.
#[derive(Parser)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the delivery engine, reconciler and HTTP control surface.
    Serve {
        /// Begin delivering immediately instead of waiting for `POST /start`.
        #[arg(long)]
        start: bool,
    },
    /// Run one reconciliation sweep and print the report.
    Reconcile,
    /// Queue a message for delivery.
    Enqueue {
        /// Recipient address.
        #[arg(long)]
        to: String,
        /// Message body.
        #[arg(long)]
        content: String,
    },
    /// Print every completion record as JSON.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = HeraldConfig::load().context("failed to load configuration")?;

    match cli.command {
        Command::Serve { start } => handle_serve(config, start).await,
        Command::Reconcile => handle_reconcile(config).await,
        Command::Enqueue { to, content } => handle_enqueue(config, &to, &content).await,
        Command::List => handle_list(config).await,
    }
}

/// Run the long-lived service until ctrl-c or an engine halt.
async fn handle_serve(config: HeraldConfig, start: bool) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    let logs_dir = config.log_dir()?;
    let _logging_guard = herald::logging::init_production(&logs_dir, &config.logging.level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "herald starting");

    let store = Arc::new(
        SqliteMessageStore::open_with(&config.database_path()?, config.database.busy_timeout())
            .await?,
    );
    let cache = Arc::new(
        RedisRecordCache::connect(&config.cache.redis_url)
            .await
            .context("failed to connect to record cache")?,
    );
    let sender = Arc::new(WebhookSender::new(
        config.webhook.url.clone(),
        Duration::from_secs(config.webhook.timeout_secs),
    )?);
    info!(url = %sender.url(), "webhook sender ready");

    let control = Arc::new(DeliveryControl::new());
    if start {
        control.start();
    }

    let engine = DeliveryEngine::new(
        store.clone(),
        cache.clone(),
        sender,
        Arc::clone(&control),
        config.delivery_config(),
    );
    let reconciler = Reconciler::new(store, cache.clone(), config.reconcile_config());
    info!(
        batch_limit = engine.config().batch_limit,
        record_ttl_secs = engine.config().record_ttl.map_or(0, |ttl| ttl.as_secs()),
        sweep_timeout_secs = reconciler.config().sweep_timeout.as_secs(),
        "delivery configured"
    );

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    let state = AppState {
        control,
        cache: cache as Arc<dyn RecordCache>,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut engine_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { engine.run(shutdown_rx).await }
    });
    let reconciler_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { reconciler.run(shutdown_rx).await }
    });
    let server_task = tokio::spawn(api::serve(listener, state, shutdown_rx));

    info!("herald ready");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("received shutdown signal, initiating graceful shutdown");
            Ok(())
        }
        joined = &mut engine_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("delivery engine halted")),
            Err(e) => Err(anyhow::anyhow!("delivery engine task failed: {e}")),
        },
    };

    let _ = shutdown_tx.send(true);

    if !engine_task.is_finished() {
        match engine_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "delivery engine stopped with error during shutdown"),
            Err(e) => error!(error = %e, "delivery engine task failed"),
        }
    }
    if let Err(e) = reconciler_task.await {
        error!(error = %e, "reconciler task failed");
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "http api failed"),
        Err(e) => error!(error = %e, "http api task failed"),
    }

    info!("herald stopped");
    outcome
}

/// Run one reconciliation sweep.
async fn handle_reconcile(config: HeraldConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    herald::logging::init_cli(&config.logging.level);

    let store = Arc::new(
        SqliteMessageStore::open_with(&config.database_path()?, config.database.busy_timeout())
            .await?,
    );
    let cache = Arc::new(
        RedisRecordCache::connect(&config.cache.redis_url)
            .await
            .context("failed to connect to record cache")?,
    );

    let reconciler = Reconciler::new(store, cache, config.reconcile_config());
    let report = reconciler.reconcile_once().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Insert one pending message.
async fn handle_enqueue(config: HeraldConfig, to: &str, content: &str) -> anyhow::Result<()> {
    herald::logging::init_cli(&config.logging.level);

    anyhow::ensure!(!to.trim().is_empty(), "recipient must not be empty");

    let store =
        SqliteMessageStore::open_with(&config.database_path()?, config.database.busy_timeout())
            .await?;
    let message = store.enqueue(to, content).await?;
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

/// Dump the record cache.
async fn handle_list(config: HeraldConfig) -> anyhow::Result<()> {
    herald::logging::init_cli(&config.logging.level);

    let cache = RedisRecordCache::connect(&config.cache.redis_url)
        .await
        .context("failed to connect to record cache")?;
    let records = cache.list_all().await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
