//! Forecast alignment and the per-cycle dispatch decision.
//!
//! Everything in here is synchronous and free of I/O: "now", the forecasts
//! and the battery snapshot are passed in explicitly on every call.

pub mod align;
pub mod engine;
pub mod grid;
pub mod rate;
pub mod resample;
pub mod reserve;
pub mod state;
pub mod thresholds;

pub use align::{AlignedForecast, ForecastAligner};
pub use engine::DispatchEngine;
pub use grid::{elapsed_fraction, remaining_time_hours, IntervalGrid, IntervalPosition};
pub use rate::{target_power, MIN_REMAINING_TIME_HOURS};
pub use resample::{convert, InterpolationPolicy};
pub use reserve::{net_consumption, required_reserve_energy, ReserveAnalysis};
pub use state::{choose_mode, HoldPolicy, ModeChoice};
pub use thresholds::DispatchThresholds;
