//! Momentum Snapshot - daily momentum qualification and snapshot service.
//!
//! Wires the engines from configuration and drives snapshot creation and
//! cleanup on their cron schedules until interrupted.

mod scheduler;

use anyhow::Result;
use momentum_common::logging::init_logging;
use momentum_common::Config;
use momentum_snapshot::MomentumServices;
use tokio::sync::watch;

use crate::scheduler::SnapshotScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Momentum Snapshot v{}", env!("CARGO_PKG_VERSION"));

    let snapshot_config = config.snapshot.clone();
    let services = MomentumServices::from_config(config).await?;
    let scheduler = SnapshotScheduler::new(
        &snapshot_config,
        services.snapshots.clone(),
        services.db.clone(),
        services.clock.clone(),
    )?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        cutoff = %services.clock.cutoff(),
        "Service initialized in {:?}",
        startup_duration
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await
}
