// Scheduler daemon entry point: wires the engine, schedules active
// assignments and runs until interrupted

use common::bootstrap;
use common::config::Settings;
use common::telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    telemetry::init_logging(&settings.observability.log_level)?;

    info!("Starting extraction scheduler");

    let engine = bootstrap::build_engine(&settings).await?;

    let scheduled = engine.scheduler.initialize().await?;
    info!(scheduled, "scheduler initialized");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping scheduler");

    // pending ticks are cancelled; in-flight runs finish on their own
    engine.scheduler.stop().await;

    info!("Scheduler stopped");
    Ok(())
}
