use std::fmt;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ema::ExponentialMovingAverage;
use crate::internal_event::{InternalEvent, TrendStateRejected};

/// Tuning of the moving-average crossover detector.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `smoothing` | 2 | Numerator of the EMA smoothing factor `smoothing / (period + 1)` |
/// | `short_period` | 20 | Period of the fast EMA |
/// | `long_period` | 40 | Period of the slow EMA |
/// | `min_data_points` | 6 | Crossovers are ignored until more readings than this have been folded in |
///
/// # Example
///
/// ```rust
/// use dynamic_sampling::trends::TrendSettings;
///
/// let settings = TrendSettings::builder()
///     .short_period(10)
///     .long_period(30)
///     .build();
/// assert_eq!(settings.min_data_points(), 6);
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct TrendSettings {
    #[builder(default = default_smoothing())]
    smoothing: f64,

    #[builder(default = default_short_period())]
    short_period: u32,

    #[builder(default = default_long_period())]
    long_period: u32,

    /// Readings needed before the EMA start-up transient is considered gone.
    #[builder(default = default_min_data_points())]
    min_data_points: u64,
}

const fn default_smoothing() -> f64 {
    2.0
}

const fn default_short_period() -> u32 {
    20
}

const fn default_long_period() -> u32 {
    40
}

const fn default_min_data_points() -> u64 {
    6
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            smoothing: default_smoothing(),
            short_period: default_short_period(),
            long_period: default_long_period(),
            min_data_points: default_min_data_points(),
        }
    }
}

impl TrendSettings {
    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    pub fn short_period(&self) -> u32 {
        self.short_period
    }

    pub fn long_period(&self) -> u32 {
        self.long_period
    }

    pub fn min_data_points(&self) -> u64 {
        self.min_data_points
    }
}

/// Everything the detector remembers about one entity between readings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrendState {
    /// Timestamp of the last reading folded in, `None` before the first one.
    pub timestamp: Option<DateTime<Utc>>,
    pub count: u64,
    pub short_ma: f64,
    pub long_ma: f64,
}

/// One reading for one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendPayload {
    /// Identity of the tracked entity within its project, e.g. a transaction name or
    /// a function fingerprint.
    pub group: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl TrendPayload {
    pub fn new(group: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            group: group.into(),
            timestamp,
            value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrendType {
    Regressed,
    Improved,
    Unchanged,
}

impl TrendType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrendType::Regressed => "regressed",
            TrendType::Improved => "improved",
            TrendType::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for TrendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folds `payload` into `state` and classifies the reading.
///
/// A regression is a fresh upward cross of the fast EMA over the slow one, an
/// improvement a fresh downward cross. Staying on the same side is `Unchanged`, so a
/// sustained shift is reported exactly once.
pub fn detect_trend(settings: &TrendSettings, state: &TrendState, payload: &TrendPayload) -> (TrendState, TrendType) {
    let mut short_ma = ExponentialMovingAverage::new(settings.smoothing, settings.short_period);
    short_ma.set(state.short_ma, state.count);
    short_ma.update(payload.value);

    let mut long_ma = ExponentialMovingAverage::new(settings.smoothing, settings.long_period);
    long_ma.set(state.long_ma, state.count);
    long_ma.update(payload.value);

    let stabilized = state.count > settings.min_data_points;

    let trend = if stabilized && short_ma.value() > long_ma.value() && state.short_ma <= state.long_ma {
        TrendType::Regressed
    } else if stabilized && short_ma.value() < long_ma.value() && state.short_ma >= state.long_ma {
        TrendType::Improved
    } else {
        TrendType::Unchanged
    };

    let new_state = TrendState {
        timestamp: Some(payload.timestamp),
        count: state.count + 1,
        short_ma: short_ma.value(),
        long_ma: long_ma.value(),
    };

    (new_state, trend)
}

/// Like [`detect_trend`], but refuses readings older than the stored state.
///
/// Returns `None` for a stale reading; the caller keeps its current state.
pub fn compute_new_trend_states(
    settings: &TrendSettings,
    cur_state: &TrendState,
    payload: &TrendPayload,
) -> Option<(TrendState, TrendType)> {
    if let Some(stored) = cur_state.timestamp {
        if stored > payload.timestamp {
            TrendStateRejected {
                group: &payload.group,
                stored,
                received: payload.timestamp,
            }
            .emit();
            return None;
        }
    }

    Some(detect_trend(settings, cur_state, payload))
}
