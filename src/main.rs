// =============================================================================
// delta-hedger — Main Entry Point
// =============================================================================
//
// One binary, several entries:
//
//   run            the delta-hedging daemon
//   daemon         the daemon with supervisor-style logging (same process)
//   serve          the status/control API server
//   init-db        create or refresh the PostgreSQL schema, then exit
//   stats          print aggregate stats from status_history
//   release-locks  terminate backends stuck on the daemon's single-row tables
//
// Exit codes: 0 on success, 1 on configuration or dependency errors.
// =============================================================================

mod app;
mod broker;
mod config;
mod db;
mod fsm;
mod guards;
mod metrics;
mod portfolio;
mod pricing;
mod server;
mod state;
mod store;
mod strategy;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::{next_client_id, HedgeApp};
use crate::broker::{Broker, PaperBroker};
use crate::config::HedgeConfig;
use crate::db::{release_locks_for_tables, PostgresSink, StatusReader, DAEMON_LOCK_TABLES};
use crate::server::ServerState;

#[derive(Parser)]
#[command(name = "delta-hedger", about = "Delta-hedging daemon for options portfolios")]
struct Cli {
    /// Verbose logging (debug level).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hedging daemon.
    Run {
        /// Path to the YAML config file.
        config: Option<PathBuf>,
    },
    /// Run the daemon under supervisor-style logging (same process model).
    Daemon {
        config: Option<PathBuf>,
    },
    /// Run the status/control API server.
    Serve {
        config: Option<PathBuf>,
    },
    /// Create or refresh the database schema.
    InitDb {
        config: Option<PathBuf>,
    },
    /// Print aggregate stats from status_history.
    Stats {
        config: Option<PathBuf>,
    },
    /// Terminate backends holding locks on the daemon's single-row tables.
    ReleaseLocks {
        config: Option<PathBuf>,
    },
}

/// Resolve the config path: CLI arg, then HEDGER_CONFIG, then the default
/// location. Returns the path and whether it was explicitly requested.
fn resolve_config_path(cli_path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = cli_path {
        return (path, true);
    }
    if let Ok(env_path) = std::env::var("HEDGER_CONFIG") {
        return (PathBuf::from(env_path), true);
    }
    (PathBuf::from("config/config.yaml"), false)
}

/// Load config; an explicitly requested but unreadable file is fatal, a
/// missing default file falls back to built-in defaults.
fn load_config(cli_path: Option<PathBuf>) -> Result<(HedgeConfig, Option<PathBuf>)> {
    let (path, explicit) = resolve_config_path(cli_path);
    if path.exists() {
        let config = HedgeConfig::load(&path)?;
        Ok((config, Some(path)))
    } else if explicit {
        anyhow::bail!("config file not found: {}", path.display());
    } else {
        warn!(path = %path.display(), "config file not found; using defaults");
        Ok((HedgeConfig::default(), None))
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Command::Run { config } => run_daemon(config, false).await,
        Command::Daemon { config } => run_daemon(config, true).await,
        Command::Serve { config } => run_server(config).await,
        Command::InitDb { config } => init_db(config).await,
        Command::Stats { config } => print_stats(config).await,
        Command::ReleaseLocks { config } => release_locks(config).await,
    }
}

// =============================================================================
// run / daemon
// =============================================================================

async fn run_daemon(config_path: Option<PathBuf>, supervisor: bool) -> Result<()> {
    let (config, resolved_path) = load_config(config_path)?;

    info!(
        symbol = %config.symbol,
        paper_trade = config.resolved_risk().paper_trade,
        supervisor,
        "delta-hedger starting"
    );

    // ── Persistence ─────────────────────────────────────────────────────
    let sink = if config.status.sink == "postgres" {
        match PostgresSink::connect(&config.status.postgres).await {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                warn!(error = %e, "postgres sink unavailable; running without persistence");
                None
            }
        }
    } else {
        None
    };

    // ── Broker session ──────────────────────────────────────────────────
    // Client id: last recorded + 1 after an abnormal exit, so a crashed
    // session cannot collide with its own leftover connection.
    let last_client_id = match &sink {
        Some(sink) => sink.get_last_ib_client_id().await,
        None => None,
    };
    let client_id = next_client_id(last_client_id, config.ib.client_id);
    if let Some(sink) = &sink {
        if let Some(settings) = sink.get_ib_connection_config().await {
            info!(
                host = %settings.host,
                port_type = %settings.port_type,
                port = settings.port,
                "broker endpoint from settings table"
            );
        }
    }
    info!(client_id, "broker client id selected");
    let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(client_id));

    // ── App wiring ──────────────────────────────────────────────────────
    let (app, events_rx) = HedgeApp::new(config, resolved_path, broker, sink);

    let signal_app = app.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received");
            signal_app.request_stop();
        }
    });

    app.run(events_rx).await
}

// =============================================================================
// serve
// =============================================================================

async fn run_server(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let reader = StatusReader::connect(&config.status.postgres)
        .await
        .context("status reader requires a reachable PostgreSQL instance")?;

    let state = Arc::new(ServerState {
        reader,
        data_lag_threshold_ms: Some(config.resolved_state_gates().system.data_lag_threshold_ms),
    });

    let addr = format!("0.0.0.0:{}", config.status_server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind status server on {addr}"))?;
    info!(addr = %addr, "status server listening");
    axum::serve(listener, server::router(state))
        .await
        .context("status server failed")
}

// =============================================================================
// init-db / stats / release-locks
// =============================================================================

async fn init_db(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let sink = PostgresSink::connect(&config.status.postgres)
        .await
        .context("schema init requires a reachable PostgreSQL instance")?;
    sink.ensure_tables().await?;
    sink.close().await;
    info!("database schema is up to date");
    Ok(())
}

async fn print_stats(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let reader = StatusReader::connect(&config.status.postgres)
        .await
        .context("stats require a reachable PostgreSQL instance")?;
    match reader.history_stats().await {
        Some(stats) => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        None => anyhow::bail!("status_history is unavailable"),
    }
}

async fn release_locks(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let released = release_locks_for_tables(&config.status.postgres, &DAEMON_LOCK_TABLES).await;
    info!(released, tables = ?DAEMON_LOCK_TABLES, "lock release complete");
    println!("released {released} backend(s)");
    Ok(())
}
