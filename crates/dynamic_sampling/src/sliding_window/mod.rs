//! Per-organization sample rates derived from a trailing window of root transaction volume.

mod rate;
mod settings;
mod task;
mod volumes;

pub use rate::{
    RateError, SamplingTier, SamplingTierSource, TierTable, compute_guarded_sliding_window_sample_rate,
    compute_sliding_window_sample_rate, extrapolate_monthly_volume,
};
pub use settings::{SLIDING_WINDOW_ORG_TASK, SlidingWindowSettings};
pub use task::{
    ADJUST_BASE_SAMPLE_RATE_OF_ORG, SlidingWindowOrgTask, TaskOutcome, generate_sliding_window_org_cache_key,
    get_org_sample_rate, last_sliding_window_org_execution, mark_sliding_window_org_executed,
    was_sliding_window_org_executed,
};
pub use volumes::{ActiveOrgVolumes, FETCH_ORGS_VOLUMES, OrgVolume, StaticVolumeSource, VolumeQuery, VolumeSource};

pub type OrgId = u64;
