use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta};
use chrono_tz::Tz;

use super::{hour_of_day, local_interval_start, ForecastProvider};
use crate::domain::{ForecastKind, ForecastSeries, SeriesAnchor};

/// Household load: a base load plus gaussian bumps in the morning and evening.
///
/// The series starts at the native interval containing "now" and carries
/// energy per interval.
#[derive(Debug, Clone)]
pub struct SimpleConsumptionForecaster {
    pub base_w: f64,
    pub morning_w: f64,
    pub evening_w: f64,
    pub resolution_minutes: u32,
    pub horizon_hours: u32,
    pub timezone: Tz,
}

impl Default for SimpleConsumptionForecaster {
    fn default() -> Self {
        Self {
            base_w: 600.0,
            morning_w: 1000.0,
            evening_w: 1600.0,
            resolution_minutes: 15,
            horizon_hours: 48,
            timezone: chrono_tz::UTC,
        }
    }
}

impl SimpleConsumptionForecaster {
    /// Average load in W at a fractional local hour; never below 200 W.
    pub fn load_at(&self, hour: f64) -> f64 {
        let morning = bump(hour, 7.5, 1.5) * self.morning_w;
        let evening = bump(hour, 18.5, 2.0) * self.evening_w;
        (self.base_w + morning + evening).max(200.0)
    }
}

fn bump(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma.max(0.01);
    (-0.5 * z * z).exp()
}

#[async_trait]
impl ForecastProvider for SimpleConsumptionForecaster {
    fn native_resolution(&self) -> u32 {
        self.resolution_minutes
    }

    fn kind(&self) -> ForecastKind {
        ForecastKind::Energy
    }

    fn anchor(&self) -> SeriesAnchor {
        SeriesAnchor::CurrentInterval
    }

    async fn fetch(&self, now: DateTime<FixedOffset>) -> Result<ForecastSeries> {
        ensure!(
            self.resolution_minutes > 0 && 60 % self.resolution_minutes == 0,
            "consumption resolution must divide 60 minutes, got {}",
            self.resolution_minutes
        );
        let start = local_interval_start(now, self.timezone, self.resolution_minutes)?;
        let slot_hours = f64::from(self.resolution_minutes) / 60.0;
        let slots = self.horizon_hours * 60 / self.resolution_minutes;

        let values = (0..slots)
            .map(|i| {
                let t = start + TimeDelta::minutes(i64::from(i * self.resolution_minutes));
                self.load_at(hour_of_day(&t) + slot_hours / 2.0) * slot_hours
            })
            .collect();
        Ok(ForecastSeries::energy(self.resolution_minutes, values).with_anchor(SeriesAnchor::CurrentInterval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_load_profile_peaks_in_evening() {
        let load = SimpleConsumptionForecaster::default();
        assert!(load.load_at(18.5) > load.load_at(7.5));
        assert!(load.load_at(7.5) > load.load_at(3.0));
        assert!(load.load_at(3.0) >= 600.0);
    }

    #[tokio::test]
    async fn test_fetch_starts_at_current_interval() {
        let load = SimpleConsumptionForecaster {
            horizon_hours: 2,
            ..Default::default()
        };
        let now = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 1, 18, 20, 0)
            .unwrap();
        let series = load.fetch(now).await.unwrap();
        assert_eq!(series.len(), 8);
        assert_eq!(series.kind, ForecastKind::Energy);
        assert_eq!(series.anchor, SeriesAnchor::CurrentInterval);
        // first slot is 18:15-18:30, sampled at 18:22:30
        let expected = load.load_at(18.375) * 0.25;
        assert!((series.values[0] - expected).abs() < 1e-9);
    }
}
