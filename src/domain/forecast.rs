use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

use crate::error::{DispatchError, Result};

/// Physical meaning of the values in a forecast series.
///
/// The kind decides how resolution conversion treats a value: energies are
/// additive and get redistributed, prices and powers are representative and
/// get replicated or averaged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ForecastKind {
    /// Wh per interval.
    Energy,
    /// Currency per kWh.
    Price,
    /// Average W over the interval.
    Power,
}

impl ForecastKind {
    /// True when values add up across sub-intervals.
    pub fn is_additive(self) -> bool {
        matches!(self, Self::Energy)
    }
}

/// Where index 0 of a provider's native series sits in time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SeriesAnchor {
    /// Index 0 starts at the top of the current hour.
    #[default]
    CurrentHour,
    /// Index 0 is the native-resolution interval containing "now".
    CurrentInterval,
}

/// A contiguous forecast at one native resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastSeries {
    pub kind: ForecastKind,
    pub resolution_minutes: u32,
    pub anchor: SeriesAnchor,
    pub values: Vec<f64>,
}

impl ForecastSeries {
    pub fn new(
        kind: ForecastKind,
        resolution_minutes: u32,
        anchor: SeriesAnchor,
        values: Vec<f64>,
    ) -> Self {
        Self {
            kind,
            resolution_minutes,
            anchor,
            values,
        }
    }

    pub fn energy(resolution_minutes: u32, values: Vec<f64>) -> Self {
        Self::new(ForecastKind::Energy, resolution_minutes, SeriesAnchor::CurrentHour, values)
    }

    pub fn price(resolution_minutes: u32, values: Vec<f64>) -> Self {
        Self::new(ForecastKind::Price, resolution_minutes, SeriesAnchor::CurrentHour, values)
    }

    pub fn power(resolution_minutes: u32, values: Vec<f64>) -> Self {
        Self::new(ForecastKind::Power, resolution_minutes, SeriesAnchor::CurrentHour, values)
    }

    pub fn with_anchor(mut self, anchor: SeriesAnchor) -> Self {
        self.anchor = anchor;
        self
    }

    /// Builds a series from an index -> value mapping as providers deliver it.
    ///
    /// Indices must be contiguous from 0; a gap fails with
    /// [`DispatchError::SparseForecast`] naming the first missing index.
    pub fn from_indexed(
        role: &'static str,
        kind: ForecastKind,
        resolution_minutes: u32,
        anchor: SeriesAnchor,
        indexed: &BTreeMap<usize, f64>,
    ) -> Result<Self> {
        let mut values = Vec::with_capacity(indexed.len());
        for (expected, (&index, &value)) in indexed.iter().enumerate() {
            if index != expected {
                return Err(DispatchError::SparseForecast {
                    role,
                    missing_index: expected,
                });
            }
            values.push(value);
        }
        Ok(Self::new(kind, resolution_minutes, anchor, values))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum of all values; meaningful for energy series only.
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}
