//! Moving-average crossover detection of regressions and improvements.

mod detector;
mod ema;
mod processor;
mod store;

pub use detector::{TrendPayload, TrendSettings, TrendState, TrendType, compute_new_trend_states, detect_trend};
pub use ema::ExponentialMovingAverage;
pub use processor::process_trend_payloads;
pub use store::{DetectorKind, TrendStateStore, TrendStoreSettings};

pub type ProjectId = u64;
