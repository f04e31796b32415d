use std::time::Duration;

use bon::Builder;

pub const SLIDING_WINDOW_ORG_TASK: &str = "sliding_window_org";

/// Configuration of the sliding-window organization sample rate task.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `enabled` | true | When false the task returns immediately without touching anything |
/// | `window_size_hours` | 24 | Trailing window the org volume is measured over. `0` disables the task |
/// | `max_orgs_per_query` | 100 | Page size of the volume query |
/// | `max_task_duration` | 60 min | Wall-clock budget of one run |
/// | `rate_ttl` | 24 h | Expiry of each stored rate |
/// | `task_name` | `sliding_window_org` | Name used in logs and metrics |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use dynamic_sampling::sliding_window::SlidingWindowSettings;
///
/// let settings = SlidingWindowSettings::builder()
///     .window_size_hours(6)
///     .max_task_duration(Duration::from_secs(300))
///     .build();
/// assert_eq!(settings.window_size(), Some(6));
/// ```
#[derive(Clone, Debug, Builder)]
pub struct SlidingWindowSettings {
    #[builder(default = true)]
    enabled: bool,

    #[builder(default = default_window_size_hours())]
    window_size_hours: u32,

    #[builder(default = default_max_orgs_per_query())]
    max_orgs_per_query: usize,

    /// Deadline of one run, checked before each page fetch and each organization.
    #[builder(default = default_max_task_duration())]
    max_task_duration: Duration,

    #[builder(default = default_rate_ttl())]
    rate_ttl: Duration,

    #[builder(default = SLIDING_WINDOW_ORG_TASK.to_string(), into)]
    task_name: String,
}

const fn default_window_size_hours() -> u32 {
    24
}

const fn default_max_orgs_per_query() -> usize {
    100
}

const fn default_max_task_duration() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_rate_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for SlidingWindowSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size_hours: default_window_size_hours(),
            max_orgs_per_query: default_max_orgs_per_query(),
            max_task_duration: default_max_task_duration(),
            rate_ttl: default_rate_ttl(),
            task_name: SLIDING_WINDOW_ORG_TASK.to_string(),
        }
    }
}

impl SlidingWindowSettings {
    /// Window size in hours, or `None` when sample rate adjustment is switched off.
    pub fn window_size(&self) -> Option<u32> {
        (self.enabled && self.window_size_hours > 0).then_some(self.window_size_hours)
    }

    pub fn max_orgs_per_query(&self) -> usize {
        self.max_orgs_per_query.max(1)
    }

    pub fn max_task_duration(&self) -> Duration {
        self.max_task_duration
    }

    pub fn rate_ttl(&self) -> Duration {
        self.rate_ttl
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }
}
