use thiserror::Error;

use crate::domain::ForecastKind;

/// Errors that abort the current evaluation cycle.
///
/// None of these carry a fallback decision; the caller decides whether to keep
/// the previous mode or switch to a safe default.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("Invalid time input: {0}")]
    InvalidTime(String),

    #[error("Unsupported resolution ratio: {native} min -> {target} min")]
    UnsupportedResolutionRatio { native: u32, target: u32 },

    #[error("Insufficient forecast horizon: aligned length is 0")]
    InsufficientForecastHorizon,

    #[error("Sparse {role} forecast: index {missing_index} is missing")]
    SparseForecast { role: &'static str, missing_index: usize },

    #[error("{role} forecast has kind {found}, expected {expected}")]
    KindMismatch {
        role: &'static str,
        expected: &'static str,
        found: ForecastKind,
    },

    #[error("Invalid threshold {name}: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
