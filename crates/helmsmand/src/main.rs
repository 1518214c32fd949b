//! helmsmand — the helmsman deployment daemon.
//!
//! Single binary that opens the deployment and coordination stores,
//! revives deployments interrupted by the previous process, starts the
//! queue worker pool, and serves the HTTP intake API.
//!
//! # Usage
//!
//! ```text
//! helmsmand --config /etc/helmsman/helmsman.toml
//! helmsmand --config helmsman.toml --port 9090
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use helmsman_api::{build_router, ApiState};
use helmsman_coordination::CoordinationStore;
use helmsman_engine::PipelineEngine;
use helmsman_orchestrator::Orchestrator;
use helmsman_remote::AsgClient;
use helmsman_store::DeploymentStore;
use helmsman_tracker::TaskTracker;

use config::HelmsmanConfig;

#[derive(Parser)]
#[command(name = "helmsmand", about = "Helmsman deployment orchestrator daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "helmsman.toml")]
    config: PathBuf,

    /// Override the configured API port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,helmsmand=debug,helmsman=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        HelmsmanConfig::from_file(&cli.config)?
    } else {
        info!(path = ?cli.config, "no configuration file found, using defaults");
        HelmsmanConfig::default()
    };
    let port = cli.port.unwrap_or(config.server.port);

    // ── Stores ─────────────────────────────────────────────────────

    std::fs::create_dir_all(&config.store.data_dir)?;
    let store = DeploymentStore::open(&config.store.data_dir.join("deployments.redb"))?;
    let coordination = CoordinationStore::open(
        &config.store.data_dir.join("coordination.redb"),
        &config.coordination.prefix,
    )?;
    info!(data_dir = ?config.store.data_dir, "stores opened");

    // ── Pipeline wiring ────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let remote = Arc::new(AsgClient::new(config.remote.remote_config())?);
    let tracker = TaskTracker::new(
        Arc::clone(&remote),
        store.clone(),
        Duration::from_millis(config.deploy.poll_interval_ms),
        shutdown_rx.clone(),
    );
    let engine = PipelineEngine::new(
        store.clone(),
        coordination.clone(),
        remote,
        tracker,
        config.deploy.engine_config(&config.remote),
        shutdown_rx.clone(),
    );
    let orchestrator = Orchestrator::new(store.clone(), coordination.clone(), engine);
    info!("pipeline engine initialized");

    // Revive deployments interrupted by the previous process.
    let restarted = orchestrator.restart_sweep().await?;
    info!(restarted, "restart sweep completed");

    // Queue worker pool.
    let workers = orchestrator.spawn_workers(config.queue.consumer_options(), shutdown_rx.clone());

    // ── API server ─────────────────────────────────────────────────

    let state = ApiState {
        store,
        queue: coordination.queue(),
        coordination,
        orchestrator,
        config_service: Arc::new(config.config_service()),
        service_name: "helmsman".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for worker in workers {
        let _ = worker.await;
    }

    info!("helmsmand stopped");
    Ok(())
}
