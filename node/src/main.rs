// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Bitsave Node
//!
//! Entry point for the `bitsave-node` binary. Parses CLI arguments,
//! initializes logging and metrics, deploys the ledger, and serves the
//! HTTP/WS API.
//!
//! The binary supports three subcommands:
//!
//! - `run`    : start the node
//! - `config` : print the effective ledger configuration
//! - `version`: print build version information

mod api;
mod cli;
mod clock;
mod logging;
mod metrics;
mod stream;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use bitsave_protocol::storage::BitsaveDB;
use bitsave_protocol::{BitsaveConfig, EventLog, MemoryEventLog};

use cli::{BitsaveNodeCli, Commands};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BitsaveNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Config(args) => print_config(&args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: ledger, API server, and metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format)
        .context("failed to initialize logging")?;

    let config = args.ledger.resolve()?;
    tracing::info!(
        rpc_port = args.rpc_port,
        metrics_port = args.metrics_port,
        master = %config.master,
        stable_coin = %config.stable_coin,
        cs_token = %config.cs_token,
        join_fee = %config.join_fee,
        saving_fee = %config.saving_fee,
        "starting bitsave-node"
    );

    // --- Event log ---
    let db = match &args.data_dir {
        Some(dir) => Some(Arc::new(open_event_store(dir, &config)?)),
        None => None,
    };
    let log: Arc<dyn EventLog> = match &db {
        Some(db) => db.clone(),
        None => {
            tracing::warn!("no --data-dir given, events are kept in memory only");
            Arc::new(MemoryEventLog::new())
        }
    };

    // --- Metrics ---
    let node_metrics =
        Arc::new(NodeMetrics::new().context("failed to register prometheus metrics")?);

    // --- Application state ---
    let app_state = api::AppState::new(
        config,
        log,
        Arc::clone(&node_metrics),
        format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            bitsave_protocol::config::PROTOCOL_VERSION,
        ),
    )
    .context("failed to deploy ledger")?;
    tracing::info!(protocol_address = %app_state.bitsave.address(), "ledger deployed");

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.rpc_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", api_addr))?;
    tracing::info!("RPC/API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    if let Some(db) = db {
        db.flush().context("failed to flush event log")?;
    }
    tracing::info!("bitsave-node stopped");
    Ok(())
}

/// Opens the durable event log under `data_dir`.
///
/// Ledger state lives in memory and is not rebuilt from the log, so a
/// directory that already holds events is refused. A directory written
/// under a different configuration is refused as well.
fn open_event_store(data_dir: &Path, config: &BitsaveConfig) -> Result<BitsaveDB> {
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;

    let db = BitsaveDB::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    match db.get_config().context("failed to read stored configuration")? {
        Some(stored) if &stored != config => {
            bail!(
                "{} was written under a different ledger configuration",
                db_path.display()
            );
        }
        Some(_) => {}
        None => db.put_config(config).context("failed to store configuration")?,
    }

    if !db.is_empty() {
        bail!(
            "{} already holds {} events; start with an empty --data-dir",
            db_path.display(),
            db.len()
        );
    }

    tracing::info!(path = %db_path.display(), "event log opened");
    Ok(db)
}

/// Prints the effective configuration as JSON to stdout.
fn print_config(args: &cli::LedgerArgs) -> Result<()> {
    let config = args.resolve()?;
    let json = serde_json::to_string_pretty(&config).context("failed to encode configuration")?;
    println!("{}", json);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("bitsave-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", bitsave_protocol::config::PROTOCOL_VERSION);
    println!("rustc        {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
