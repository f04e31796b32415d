//! Adaptive sampling control for an event-ingestion pipeline.
//!
//! Two background components live in this crate:
//!
//! 1. **Sliding-window rate controller**: scans the root transaction volume of every
//!    active organization over a trailing window, maps that volume to a sample rate in
//!    `[0, 1]` and stores it under a per-organization key with a TTL. Runs under a hard
//!    wall-clock budget that is checked before each organization is touched.
//! 2. **Trend detector**: folds a per-entity stream of metric readings into a fast and a
//!    slow exponential moving average and reports upward (`Regressed`) or downward
//!    (`Improved`) crossovers. State is persisted between runs and stale readings are
//!    rejected.
//!
//! # Algorithm Overview
//!
//! Trend detection uses a moving-average crossover:
//! 1. **Seed**: restore both EMAs from the persisted state
//! 2. **Update**: fold the new reading into both EMAs
//! 3. **Classify**: once more than `min_data_points` readings have been seen, a fresh
//!    upward cross of the fast EMA is a regression, a fresh downward cross an improvement
//!
//! Rate control never erases a stored rate: when no rate can be computed for an
//! organization the previous value is left to expire on its own.
//!
//! # Basic Usage
//! ```
//! use dynamic_sampling::trends::{TrendPayload, TrendSettings, TrendState, compute_new_trend_states};
//!
//! let settings = TrendSettings::default();
//! let payload = TrendPayload::new("checkout", chrono::Utc::now(), 12.5);
//! let (state, trend) = compute_new_trend_states(&settings, &TrendState::default(), &payload)
//!     .expect("first reading is never stale");
//! assert_eq!(state.count, 1);
//! # let _ = trend;
//! ```
//!
//! # Metrics
//! Emits metrics via the [`internal_event::InternalEvent`] trait
pub mod clock;
pub mod internal_event;
pub mod sliding_window;
pub mod store;
pub mod task_context;
pub mod trends;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
