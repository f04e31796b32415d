use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::OrgId;
use crate::internal_event::{InternalEvent, SampleRateComputationFailed};

const DAYS_IN_MONTH: u64 = 30;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RateError {
    #[snafu(display("Invalid sampling tier table: {details}"))]
    InvalidTierTable { details: String },

    #[snafu(display("Failed to parse sampling tier table: {source}"))]
    ParseTierTable { source: serde_json::Error },

    #[snafu(display("Sampling tier lookup failed for org {org_id}: {source}"))]
    TierLookup { org_id: OrgId, source: crate::Error },

    #[snafu(display("Sampling tier for org {org_id} has sample rate {sample_rate} outside [0, 1]"))]
    RateOutOfRange { org_id: OrgId, sample_rate: f64 },
}

/// Scales a volume observed over `window_hours` to a 30-day month, rounding up.
///
/// Returns `None` for an empty window since nothing can be extrapolated from it.
pub fn extrapolate_monthly_volume(volume: u64, window_hours: u32) -> Option<u64> {
    if window_hours == 0 {
        return None;
    }
    let scaled = u128::from(volume) * u128::from(DAYS_IN_MONTH * 24);
    let monthly = scaled.div_ceil(u128::from(window_hours));
    Some(u64::try_from(monthly).unwrap_or(u64::MAX))
}

/// A monthly volume ceiling and the sample rate that applies up to it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingTier {
    pub volume: u64,
    pub sample_rate: f64,
}

/// Maps an organization's extrapolated monthly volume to its sampling tier.
pub trait SamplingTierSource: Send + Sync {
    fn tier_for_volume(&self, org_id: OrgId, monthly_volume: u64) -> Result<Option<SamplingTier>, crate::Error>;
}

/// A fixed, validated list of tiers shared by every organization.
///
/// Volumes must be strictly ascending and rates must not increase with volume, so a
/// larger organization never ends up with a higher sample rate than a smaller one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TierTable {
    tiers: Vec<SamplingTier>,
}

impl TierTable {
    pub fn new(tiers: Vec<SamplingTier>) -> Result<Self, RateError> {
        for tier in &tiers {
            if !(0.0..=1.0).contains(&tier.sample_rate) {
                return Err(RateError::InvalidTierTable {
                    details: format!("sample rate {} for volume {} is outside [0, 1]", tier.sample_rate, tier.volume),
                });
            }
        }
        for pair in tiers.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if upper.volume <= lower.volume {
                return Err(RateError::InvalidTierTable {
                    details: format!("volumes must be strictly ascending, got {} after {}", upper.volume, lower.volume),
                });
            }
            if upper.sample_rate > lower.sample_rate {
                return Err(RateError::InvalidTierTable {
                    details: format!(
                        "sample rate rises from {} to {} at volume {}",
                        lower.sample_rate, upper.sample_rate, upper.volume
                    ),
                });
            }
        }
        Ok(Self { tiers })
    }

    /// Parses a JSON array of `{"volume": .., "sample_rate": ..}` objects.
    pub fn from_json(raw: &str) -> Result<Self, RateError> {
        let tiers: Vec<SamplingTier> = serde_json::from_str(raw).context(ParseTierTableSnafu)?;
        Self::new(tiers)
    }

    pub fn tiers(&self) -> &[SamplingTier] {
        &self.tiers
    }
}

impl SamplingTierSource for TierTable {
    /// First tier whose ceiling covers the volume; volumes above every ceiling get the
    /// last tier.
    fn tier_for_volume(&self, _org_id: OrgId, monthly_volume: u64) -> Result<Option<SamplingTier>, crate::Error> {
        Ok(self
            .tiers
            .iter()
            .find(|tier| monthly_volume <= tier.volume)
            .or_else(|| self.tiers.last())
            .copied())
    }
}

/// Sample rate for an organization given its root transaction count over the window.
///
/// `Ok(None)` means there is nothing to go on and the caller must keep whatever rate it
/// already has.
pub fn compute_sliding_window_sample_rate(
    tiers: &dyn SamplingTierSource,
    org_id: OrgId,
    total_root_count: u64,
    window_size: u32,
) -> Result<Option<f64>, RateError> {
    let Some(monthly_volume) = extrapolate_monthly_volume(total_root_count, window_size) else {
        debug!(target: "dynamic_sampling::sliding_window", org_id, window_size, "Cannot extrapolate monthly volume");
        return Ok(None);
    };

    let tier = tiers
        .tier_for_volume(org_id, monthly_volume)
        .context(TierLookupSnafu { org_id })?;
    let Some(tier) = tier else {
        debug!(target: "dynamic_sampling::sliding_window", org_id, monthly_volume, "No sampling tier for volume");
        return Ok(None);
    };

    if !(0.0..=1.0).contains(&tier.sample_rate) {
        return Err(RateError::RateOutOfRange {
            org_id,
            sample_rate: tier.sample_rate,
        });
    }

    Ok(Some(tier.sample_rate))
}

/// [`compute_sliding_window_sample_rate`] with failures logged and turned into `None`,
/// so an error can never lead to a rate being written.
pub fn compute_guarded_sliding_window_sample_rate(
    tiers: &dyn SamplingTierSource,
    org_id: OrgId,
    total_root_count: u64,
    window_size: u32,
) -> Option<f64> {
    match compute_sliding_window_sample_rate(tiers, org_id, total_root_count, window_size) {
        Ok(sample_rate) => sample_rate,
        Err(error) => {
            SampleRateComputationFailed { org_id, error: &error }.emit();
            None
        }
    }
}
