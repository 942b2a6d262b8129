pub mod config;
pub mod controller;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod telemetry;

pub use dispatch::{DispatchEngine, DispatchThresholds, HoldPolicy};
pub use domain::{BatterySnapshot, DispatchDecision, ForecastKind, ForecastSeries, InverterMode};
pub use error::DispatchError;
