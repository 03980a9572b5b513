use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use plantsim_runtime::manager::SessionOrchestrator;
use plantsim_runtime::pool::PoolConfig;
use plantsim_runtime::{ManagerConfig, SessionManager, WorkerPool};
use plantsim_sim::line_engine_factory;
use plantsim_store::Database;
use plantsim_telemetry::TelemetryConfig;

/// Multi-tenant orchestrator for time-accelerated factory-floor simulations.
#[derive(Parser)]
#[command(name = "plantsim", version)]
struct Args {
    /// Port for the WebSocket/HTTP control surface.
    #[arg(long, default_value_t = 9210)]
    port: u16,

    /// Path to the session database. Defaults to ~/.plantsim/database/plantsim.db.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = Arc::new(plantsim_telemetry::init_telemetry(TelemetryConfig::default()));
    tracing::info!("starting plantsim orchestrator");

    let db_path = args.db_path.unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)?;

    let pool = WorkerPool::new(db.clone(), line_engine_factory(), PoolConfig::default());
    let manager = SessionManager::new(db.clone(), pool, ManagerConfig::default());

    // Reconcile persisted state before the control surface opens: interrupted
    // sessions wait for an explicit user decision, nothing restarts on its own
    let summary = manager.initialize().await?;
    tracing::info!(
        interrupted = summary.interrupted_count,
        expired = summary.expired_count,
        stale = summary.stale_count,
        "startup reconciliation done"
    );

    let orchestrator: Arc<dyn SessionOrchestrator> = manager.clone();
    let config = plantsim_server::ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = plantsim_server::start(config, db, orchestrator, Some(telemetry)).await?;
    tracing::info!(port = handle.port, "plantsim ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    handle.shutdown();
    manager.shutdown().await;
    handle.drain().await;
    Ok(())
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".plantsim")
        .join("database")
        .join("plantsim.db")
}
