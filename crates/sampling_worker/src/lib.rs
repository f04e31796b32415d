//! Scheduled runner for the sliding-window organization sample rate task.
//!
//! The worker reads its settings from the environment (see [`WorkerConfig`]), loads
//! the sampling tier table from a JSON file, and runs [`SlidingWindowOrgTask`] on a
//! fixed interval until it is asked to stop. A failed run is retried with a fixed
//! delay by [`run_with_retries`].
//!
//! Org volumes come from a JSON snapshot ([`SnapshotFileSource`]) that is re-read at
//! the start of every run. The worker does not query volumes itself, so the window
//! only slides as far as whatever keeps that file up to date.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use dynamic_sampling::sliding_window::{SlidingWindowOrgTask, StaticVolumeSource, TaskOutcome, TierTable};
use snafu::ResultExt;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

pub mod config;
pub mod retry;
pub mod snapshot;

pub use config::{ConfigError, RetrySettings, WorkerConfig};
pub use retry::{JitterMode, RetryAction, TaskRetryPolicy, run_with_retries};
pub use snapshot::SnapshotFileSource;

use config::{ReadFileSnafu, TiersSnafu, VolumesSnafu};

/// Loads a JSON tier table, e.g. `[{"volume": 1000000, "sample_rate": 1.0}, ...]`.
pub fn load_tier_table(path: &Path) -> Result<TierTable, ConfigError> {
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    TierTable::from_json(&raw).context(TiersSnafu { path })
}

/// Loads a JSON snapshot of organization volumes, e.g. `[{"org_id": 1, "total": 500}]`.
pub fn load_volume_snapshot(path: &Path) -> Result<StaticVolumeSource, ConfigError> {
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    StaticVolumeSource::from_json(&raw).context(VolumesSnafu { path })
}

/// Runs `task` every `period` until `shutdown` resolves. Returns the number of runs started.
///
/// A run in progress is finished (retries included) before shutdown is observed.
pub async fn run_scheduled<F>(task: &SlidingWindowOrgTask, period: Duration, retry: RetrySettings, shutdown: F) -> u64
where
    F: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut runs = 0;
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!(message = "Shutdown requested, stopping scheduler.", runs);
                return runs;
            }
            _ = ticker.tick() => {
                runs += 1;
                let policy = TaskRetryPolicy::new(retry.max_retries, retry.delay, retry.jitter_mode);
                match run_with_retries(policy, || task.sliding_window_org()).await {
                    Ok(TaskOutcome::Disabled) => {
                        info!(message = "Sliding window sampling is disabled.");
                    }
                    Ok(TaskOutcome::Completed { orgs_seen, rates_written }) => {
                        info!(message = "Sliding window run finished.", orgs_seen, rates_written);
                    }
                    Err(error) => {
                        error!(message = "Sliding window run failed.", %error);
                    }
                }
            }
        }
    }
}
