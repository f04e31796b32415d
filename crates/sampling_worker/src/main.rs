use std::path::Path;
use std::sync::Arc;

use dynamic_sampling::clock::SystemClock;
use dynamic_sampling::store::RedisStore;
use dynamic_sampling::sliding_window::SlidingWindowOrgTask;
use sampling_worker::{SnapshotFileSource, WorkerConfig, load_tier_table, run_scheduled};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_NAME: &str = "sampling_worker.log";
const DEFAULT_FILTER: &str = "info,dynamic_sampling=debug,sampling_worker=debug";

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(true)
        .with_level(true);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking_appender)
                .with_ansi(false)
                .with_target(true)
                .with_level(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    let _guard = init_tracing(config.log_dir.as_deref())?;
    info!(
        "Tracing initialized. Default filter: '{}'. File logging: {:?}",
        DEFAULT_FILTER, config.log_dir
    );

    let tiers = load_tier_table(&config.tiers_path)?;
    let volumes = SnapshotFileSource::open(&config.volumes_path)?;
    info!(
        tiers = tiers.tiers().len(),
        path = %config.volumes_path.display(),
        "Loaded sampling tiers and org volume snapshot"
    );

    let store = RedisStore::connect(&config.redis_url).await?;
    info!("Connected to Redis");

    let task = SlidingWindowOrgTask::new(
        config.sliding_window.clone(),
        Arc::new(volumes),
        Arc::new(store),
        Arc::new(tiers),
        Arc::new(SystemClock),
    );

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    };

    let runs = run_scheduled(&task, config.schedule_interval, config.retry, shutdown).await;
    info!(runs, "Sampling worker stopped");
    Ok(())
}
