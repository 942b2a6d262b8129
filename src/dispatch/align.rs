use chrono::{DateTime, FixedOffset, Timelike};
use tracing::debug;

use super::grid::{IntervalGrid, IntervalPosition};
use super::resample::{convert, InterpolationPolicy};
use crate::domain::{Degradation, Energy, ForecastKind, ForecastSeries, Price, SeriesAnchor};
use crate::error::{DispatchError, Result};

/// Production, consumption and prices on one grid, index 0 being the running
/// interval with its elapsed share already removed from the energies.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedForecast {
    pub production: Vec<Energy>,
    pub consumption: Vec<Energy>,
    pub prices: Vec<Price>,
    pub position: IntervalPosition,
    pub degradations: Vec<Degradation>,
}

impl AlignedForecast {
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn net_consumption(&self) -> Vec<Energy> {
        super::reserve::net_consumption(&self.production, &self.consumption)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Production,
    Consumption,
    Prices,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Consumption => "consumption",
            Self::Prices => "prices",
        }
    }

    fn accepts(self, kind: ForecastKind) -> bool {
        match self {
            Self::Prices => kind == ForecastKind::Price,
            Self::Production | Self::Consumption => {
                matches!(kind, ForecastKind::Energy | ForecastKind::Power)
            }
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Prices => "price",
            Self::Production | Self::Consumption => "energy or power",
        }
    }
}

/// Brings the three raw forecasts onto the grid anchored at "now".
#[derive(Debug, Clone, Copy)]
pub struct ForecastAligner {
    grid: IntervalGrid,
    interpolation: InterpolationPolicy,
}

impl ForecastAligner {
    pub fn new(grid: IntervalGrid, interpolation: InterpolationPolicy) -> Self {
        Self { grid, interpolation }
    }

    pub fn grid(&self) -> IntervalGrid {
        self.grid
    }

    pub fn interpolation(&self) -> InterpolationPolicy {
        self.interpolation
    }

    pub fn align(
        &self,
        now: DateTime<FixedOffset>,
        production: &ForecastSeries,
        consumption: &ForecastSeries,
        prices: &ForecastSeries,
    ) -> Result<AlignedForecast> {
        let position = self.grid.position(now);
        let mut degradations = Vec::new();
        if position.rolled {
            degradations.push(Degradation::RolledToNextInterval);
        }

        let production = self.prepare(Role::Production, production, now, &position, &mut degradations)?;
        let consumption = self.prepare(Role::Consumption, consumption, now, &position, &mut degradations)?;
        let prices = self.prepare(Role::Prices, prices, now, &position, &mut degradations)?;

        // decisions must not run past the shortest forecast
        let len = production.len().min(consumption.len()).min(prices.len());
        if len == 0 {
            return Err(DispatchError::InsufficientForecastHorizon);
        }

        debug!(
            aligned_length = len,
            production_len = production.len(),
            consumption_len = consumption.len(),
            prices_len = prices.len(),
            elapsed = position.elapsed_fraction,
            "forecasts aligned"
        );

        Ok(AlignedForecast {
            production: production.into_iter().take(len).map(Energy).collect(),
            consumption: consumption.into_iter().take(len).map(Energy).collect(),
            prices: prices.into_iter().take(len).map(Price).collect(),
            position,
            degradations,
        })
    }

    fn prepare(
        &self,
        role: Role,
        series: &ForecastSeries,
        now: DateTime<FixedOffset>,
        position: &IntervalPosition,
        degradations: &mut Vec<Degradation>,
    ) -> Result<Vec<f64>> {
        if !role.accepts(series.kind) {
            return Err(DispatchError::KindMismatch {
                role: role.name(),
                expected: role.expected(),
                found: series.kind,
            });
        }

        let grid_minutes = self.grid.interval_minutes();
        let native = series.resolution_minutes;
        if native == 0 {
            return Err(DispatchError::UnsupportedResolutionRatio {
                native,
                target: grid_minutes,
            });
        }

        // A series already anchored at the running grid interval needs no shift.
        let already_current = series.anchor == SeriesAnchor::CurrentInterval && native == grid_minutes;

        let mut hour_aligned = series.clone();

        // Floor before resampling so a negative neighbour cannot bend the
        // interpolated shape of a valid interval.
        if role != Role::Prices {
            let negatives = hour_aligned.values.iter().filter(|v| **v < 0.0).count();
            if negatives > 0 {
                hour_aligned.values.iter_mut().for_each(|v| *v = v.max(0.0));
                degradations.push(Degradation::NegativeEnergyClamped {
                    role: role.name(),
                    count: negatives,
                });
            }
        }

        if series.anchor == SeriesAnchor::CurrentInterval && !already_current {
            let slots = (now.minute() / native) as usize;
            if slots > 0 {
                if let Some(&first) = hour_aligned.values.first() {
                    let mut padded = vec![first; slots];
                    padded.extend_from_slice(&hour_aligned.values);
                    hour_aligned.values = padded;
                    degradations.push(Degradation::CurrentIntervalPadded {
                        role: role.name(),
                        slots,
                    });
                }
            }
            hour_aligned.anchor = SeriesAnchor::CurrentHour;
        }

        let (converted, degradation) = convert(&hour_aligned, grid_minutes, self.interpolation, role.name())?;
        degradations.extend(degradation);

        let shift = if already_current {
            0
        } else {
            (now.minute() / grid_minutes) as usize
        } + usize::from(position.rolled);

        let mut values: Vec<f64> = converted.values.into_iter().skip(shift).collect();

        if role == Role::Prices {
            return Ok(values);
        }

        if series.kind == ForecastKind::Power {
            let hours = self.grid.interval_hours();
            values.iter_mut().for_each(|v| *v *= hours);
        }

        if let Some(first) = values.first_mut() {
            *first *= 1.0 - position.elapsed_fraction;
        }

        Ok(values)
    }
}
