use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dynamic_sampling::sliding_window::SlidingWindowSettings;
use snafu::Snafu;
use tracing::warn;

use crate::retry::JitterMode;

// --- Configuration Environment Variable Names ---
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_SAMPLING_TIERS_PATH: &str = "SAMPLING_TIERS_PATH";
pub const ENV_ORG_VOLUMES_PATH: &str = "ORG_VOLUMES_PATH";
pub const ENV_LOG_DIR: &str = "LOG_DIR";

const ENV_WINDOW_SIZE_HOURS: &str = "SLIDING_WINDOW_SIZE_HOURS";
const ENV_MAX_ORGS_PER_QUERY: &str = "SLIDING_WINDOW_MAX_ORGS_PER_QUERY";
const ENV_MAX_TASK_SECS: &str = "SLIDING_WINDOW_MAX_TASK_SECS";
const ENV_RATE_TTL_SECS: &str = "SAMPLE_RATE_TTL_SECS";
const ENV_SCHEDULE_INTERVAL_SECS: &str = "SCHEDULE_INTERVAL_SECS";
const ENV_TASK_MAX_RETRIES: &str = "TASK_MAX_RETRIES";
const ENV_TASK_RETRY_DELAY_SECS: &str = "TASK_RETRY_DELAY_SECS";
const ENV_TASK_RETRY_JITTER: &str = "TASK_RETRY_JITTER";

const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 10 * 60;
const DEFAULT_TASK_MAX_RETRIES: usize = 5;
const DEFAULT_TASK_RETRY_DELAY_SECS: u64 = 5;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Required environment variable '{name}' not set"))]
    MissingVar { name: &'static str },

    #[snafu(display("Failed to read {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("Invalid sampling tier table in {}: {source}", path.display()))]
    Tiers {
        path: PathBuf,
        source: dynamic_sampling::sliding_window::RateError,
    },

    #[snafu(display("Invalid org volume snapshot in {}: {source}", path.display()))]
    Volumes { path: PathBuf, source: serde_json::Error },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub delay: Duration,
    pub jitter_mode: JitterMode,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_TASK_MAX_RETRIES,
            delay: Duration::from_secs(DEFAULT_TASK_RETRY_DELAY_SECS),
            jitter_mode: JitterMode::None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub tiers_path: PathBuf,
    pub volumes_path: PathBuf,
    pub sliding_window: SlidingWindowSettings,
    pub schedule_interval: Duration,
    pub retry: RetrySettings,
    pub log_dir: Option<PathBuf>,
}

/// Parses `name` with a default; unparsable values are logged and replaced by the default.
fn get_var<T, L>(lookup: &L, name: &str, default_value: T) -> T
where
    T: FromStr + Debug,
    <T as FromStr>::Err: Debug,
    L: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|val_str| match val_str.trim().parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

fn require<L>(lookup: &L, name: &'static str) -> Result<String, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingVar { name })
}

impl WorkerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = SlidingWindowSettings::default();

        // Empty, "off" or "none" switches sliding-window sampling off.
        let window_size = lookup(ENV_WINDOW_SIZE_HOURS).map(|raw| raw.trim().to_ascii_lowercase());
        let enabled = !matches!(window_size.as_deref(), Some("" | "off" | "none"));
        let window_size_hours = if enabled {
            get_var(&lookup, ENV_WINDOW_SIZE_HOURS, defaults.window_size().unwrap_or(24))
        } else {
            0
        };

        let sliding_window = SlidingWindowSettings::builder()
            .enabled(enabled)
            .window_size_hours(window_size_hours)
            .max_orgs_per_query(get_var(&lookup, ENV_MAX_ORGS_PER_QUERY, defaults.max_orgs_per_query()))
            .max_task_duration(Duration::from_secs(get_var(
                &lookup,
                ENV_MAX_TASK_SECS,
                defaults.max_task_duration().as_secs(),
            )))
            .rate_ttl(Duration::from_secs(get_var(
                &lookup,
                ENV_RATE_TTL_SECS,
                defaults.rate_ttl().as_secs(),
            )))
            .build();

        let jitter_mode = match lookup(ENV_TASK_RETRY_JITTER).map(|raw| raw.trim().to_ascii_lowercase()).as_deref() {
            None | Some("" | "none") => JitterMode::None,
            Some("full") => JitterMode::Full,
            Some(other) => {
                warn!("Unknown {} '{}'. Using no jitter.", ENV_TASK_RETRY_JITTER, other);
                JitterMode::None
            }
        };

        Ok(Self {
            redis_url: require(&lookup, ENV_REDIS_URL)?,
            tiers_path: require(&lookup, ENV_SAMPLING_TIERS_PATH)?.into(),
            volumes_path: require(&lookup, ENV_ORG_VOLUMES_PATH)?.into(),
            sliding_window,
            schedule_interval: Duration::from_secs(
                get_var(&lookup, ENV_SCHEDULE_INTERVAL_SECS, DEFAULT_SCHEDULE_INTERVAL_SECS).max(1),
            ),
            retry: RetrySettings {
                max_retries: get_var(&lookup, ENV_TASK_MAX_RETRIES, DEFAULT_TASK_MAX_RETRIES),
                delay: Duration::from_secs(get_var(&lookup, ENV_TASK_RETRY_DELAY_SECS, DEFAULT_TASK_RETRY_DELAY_SECS)),
                jitter_mode,
            },
            log_dir: lookup(ENV_LOG_DIR).filter(|dir| !dir.trim().is_empty()).map(PathBuf::from),
        })
    }
}
