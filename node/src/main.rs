// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SeatPass Node
//!
//! Entry point for the `seatpass-node` binary.
//!
//! - `simulate` — run several simulated devices through the handshake
//! - `serve`    — run one device with a persisted ledger behind the UI API
//! - `points`   — print the persisted ledger
//! - `version`  — print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod simulate;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use seatpass_protocol::config::{MANUFACTURER_ID, PRESENCE_SERVICE_UUID};
use seatpass_protocol::ledger::PointsLedger;
use seatpass_protocol::storage::{SeatDb, SettingsStore};
use seatpass_protocol::{
    system_clock, ProtocolConfig, SeatDevice, SimulatedRegistry, SimulatedTransport,
};

use cli::{Commands, SeatPassCli};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SeatPassCli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate(args) => run_simulation(&args, &config).await,
        Commands::Serve(args) => serve(args, config).await,
        Commands::Points(args) => print_points(&args.data_dir),
        Commands::Version => Ok(()),
    }
}

/// Reads protocol tunables from a JSON file, or the defaults without one.
fn load_config(path: Option<&Path>) -> Result<ProtocolConfig> {
    let Some(path) = path else {
        return Ok(ProtocolConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ProtocolConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    tracing::info!(path = %path.display(), ?config, "config loaded");
    Ok(config)
}

async fn run_simulation(args: &cli::SimulateArgs, config: &ProtocolConfig) -> Result<()> {
    let reports = simulate::run(&simulate::Plan::from(args), config).await?;

    println!(
        "{:<16} {:<10} {:>8} {:>10} {:>7}",
        "DEVICE", "MODE", "POINTS", "TRANSFERS", "THANKS"
    );
    for r in &reports {
        println!(
            "{:<16} {:<10} {:>8} {:>10} {:>7}",
            r.device_id,
            format!("{:?}", r.mode),
            r.total_points,
            r.total_transfers,
            r.thank_you_messages
        );
    }
    Ok(())
}

/// Runs one device with an on-disk ledger and serves the UI API until
/// SIGINT/SIGTERM.
async fn serve(args: cli::ServeArgs, config: ProtocolConfig) -> Result<()> {
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = SeatDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let clock = system_clock();
    let registry = Arc::new(SimulatedRegistry::new(clock.clone()));
    let device = Arc::new(
        SeatDevice::with_db(
            Arc::new(SimulatedTransport::new(registry.clone())),
            &db,
            clock.clone(),
            config.clone(),
        )
        .context("failed to assemble device")?,
    );

    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let recorder = metrics::spawn_recorder(&device, node_metrics.clone());

    let mut peers = Vec::new();
    let mut drivers = Vec::new();
    for _ in 0..args.peers {
        let peer = simulate::memory_device(&registry, &clock, &config)?;
        drivers.push(simulate::spawn_giver(peer.clone(), device.settings().user_type));
        peer.start();
        peers.push(peer);
    }

    device.start();

    let state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        device: device.clone(),
        metrics: node_metrics,
        registry: args.test_routes.then(|| registry.clone()),
    };
    let router = api::create_router(state);

    let addr = format!("{}:{}", args.host, args.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    tracing::info!(
        %addr,
        device = %device.device_id(),
        peers = args.peers,
        "API listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("shutdown signal received");
    for driver in drivers {
        driver.abort();
    }
    for peer in &peers {
        peer.shutdown().await;
    }
    device.shutdown().await;
    recorder.abort();
    db.flush().context("failed to flush database")?;
    tracing::info!("seatpass-node stopped");
    Ok(())
}

fn print_points(data_dir: &Path) -> Result<()> {
    let db_path = data_dir.join("db");
    let db = SeatDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let ledger = PointsLedger::open(Arc::new(db.points())).context("failed to load ledger")?;
    let settings = SettingsStore::new(Arc::new(db.settings())).load();
    let points = ledger.snapshot();

    println!("Ledger at {}", db_path.display());
    println!("  Points    : {}", points.total_points);
    println!("  Transfers : {}", points.total_transfers);
    println!("  Mode      : {:?}", settings.user_mode);
    Ok(())
}

fn print_version() {
    println!("seatpass-node {}", env!("CARGO_PKG_VERSION"));
    println!("presence    {PRESENCE_SERVICE_UUID}");
    println!("mfr id      0x{MANUFACTURER_ID:04X}");
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
