//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles all FleetGrid subsystems:
//! - State store (redb)
//! - Deployment manager
//! - Rollout manager + scheduler loop
//! - Device gateway + management API
//!
//! # Usage
//!
//! ```text
//! fleetd serve --config /etc/fleetgrid/fleet.toml --data-dir /var/lib/fleetgrid
//! fleetd config > fleet.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fleet_core::FleetConfig;
use fleetgrid_api::{ApiState, build_router};
use fleetgrid_deploy::DeploymentManager;
use fleetgrid_rollout::{RolloutManager, RolloutScheduler, StoreTargetSelector};
use fleetgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the device and management APIs and run the rollout scheduler.
    Serve {
        /// Path to fleet.toml; defaults apply when it does not exist.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Address to listen on (overrides `server.bind`).
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Rollout scheduler interval in seconds (overrides `scheduler.tick_secs`).
        #[arg(long)]
        tick_secs: Option<u64>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            bind,
            data_dir,
            tick_secs,
        } => {
            let mut fleet = FleetConfig::load_or_default(&config)?;
            if let Some(bind) = bind {
                fleet.server.bind = bind;
            }
            if let Some(data_dir) = data_dir {
                fleet.server.data_dir = data_dir;
            }
            if let Some(tick_secs) = tick_secs {
                anyhow::ensure!(tick_secs > 0, "--tick-secs must be positive");
                fleet.scheduler.tick_secs = tick_secs;
            }
            run_server(fleet).await
        }
        Command::Config { config } => {
            print!("{}", FleetConfig::load_or_default(&config)?.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_server(config: FleetConfig) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let bind = config.server.bind;
    let tick = Duration::from_secs(config.scheduler.tick_secs);
    let config = Arc::new(config);

    let deployments = DeploymentManager::new(store.clone(), config.clone());
    let selector = Arc::new(StoreTargetSelector::new(store.clone()));
    let rollouts = RolloutManager::new(store, config, selector);
    let scheduler = RolloutScheduler::new(rollouts.clone());
    info!(tick_secs = tick.as_secs(), "rollout scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(tick, shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::new(deployments, rollouts));
    info!(addr = %bind, "API server starting");
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    let _ = scheduler_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}
