use tokio::signal;
use tracing_subscriber::EnvFilter;

use docforge::{
    config::AppConfig, jobs::default_cleanup_schedule, queue::CleanupScheduler,
    register_workers, state::build_state,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        generation_concurrency = config.generation_concurrency,
        upload_concurrency = config.upload_concurrency,
        cleanup_schedule = config.cleanup_schedule_enabled,
        "loaded docforge configuration"
    );
    // one connection per worker slot plus the broker and health loops
    let pool_size = (config.generation_concurrency
        + config.upload_concurrency
        + config.cleanup_concurrency
        + 2) as u32;
    let schedule_enabled = config.cleanup_schedule_enabled;
    let state = build_state(config, pool_size).await?;
    let queue = state.queue.clone();

    queue.start().await;
    register_workers(&state);

    let schedules = if schedule_enabled {
        CleanupScheduler::new(queue.clone(), default_cleanup_schedule()).start()
    } else {
        Vec::new()
    };

    signal::ctrl_c().await?;
    tracing::info!("worker received shutdown signal");

    queue.stop().await;
    for handle in schedules {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "cleanup schedule ended abnormally");
        }
    }
    tracing::info!("worker stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
