use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta};
use chrono_tz::Tz;

use super::{hour_of_day, local_interval_start, ForecastProvider};
use crate::domain::{ForecastKind, ForecastSeries, SeriesAnchor};

/// Clear-sky PV curve: a half sine between sunrise and sunset, scaled by a
/// fixed cloud factor. Delivers average power per native interval.
#[derive(Debug, Clone)]
pub struct SimpleProductionForecaster {
    pub peak_w: f64,
    pub sunrise: f64,
    pub sunset: f64,
    pub cloud_factor: f64,
    pub resolution_minutes: u32,
    pub horizon_hours: u32,
    pub timezone: Tz,
}

impl Default for SimpleProductionForecaster {
    fn default() -> Self {
        Self {
            peak_w: 3500.0,
            sunrise: 8.0,
            sunset: 16.0,
            cloud_factor: 0.75,
            resolution_minutes: 60,
            horizon_hours: 48,
            timezone: chrono_tz::UTC,
        }
    }
}

impl SimpleProductionForecaster {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.resolution_minutes > 0 && 60 % self.resolution_minutes == 0,
            "production resolution must divide 60 minutes, got {}",
            self.resolution_minutes
        );
        ensure!(self.sunrise < self.sunset, "sunrise must be before sunset");
        Ok(())
    }

    /// Expected PV power at a fractional local hour.
    pub fn power_at(&self, hour: f64) -> f64 {
        if hour < self.sunrise || hour > self.sunset {
            return 0.0;
        }
        let day_len = (self.sunset - self.sunrise).max(0.01);
        let x = (hour - self.sunrise) / day_len;
        (std::f64::consts::PI * x).sin().max(0.0) * self.peak_w * self.cloud_factor
    }
}

#[async_trait]
impl ForecastProvider for SimpleProductionForecaster {
    fn native_resolution(&self) -> u32 {
        self.resolution_minutes
    }

    fn kind(&self) -> ForecastKind {
        ForecastKind::Power
    }

    fn anchor(&self) -> SeriesAnchor {
        SeriesAnchor::CurrentHour
    }

    async fn fetch(&self, now: DateTime<FixedOffset>) -> Result<ForecastSeries> {
        self.validate()?;
        let start = local_interval_start(now, self.timezone, 60)?;
        let slots = self.horizon_hours * 60 / self.resolution_minutes;
        let half_slot = f64::from(self.resolution_minutes) / 120.0;

        let values = (0..slots)
            .map(|i| {
                let t = start + TimeDelta::minutes(i64::from(i * self.resolution_minutes));
                // sample at the slot midpoint
                self.power_at(hour_of_day(&t) + half_slot)
            })
            .collect();
        Ok(ForecastSeries::power(self.resolution_minutes, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_power_curve() {
        let pv = SimpleProductionForecaster::default();
        assert_eq!(pv.power_at(3.0), 0.0);
        assert_eq!(pv.power_at(20.0), 0.0);
        assert!((pv.power_at(12.0) - 3500.0 * 0.75).abs() < 1e-9);
        assert!(pv.power_at(9.0) < pv.power_at(11.0));
    }

    #[tokio::test]
    async fn test_fetch_quarter_hours() {
        let pv = SimpleProductionForecaster {
            resolution_minutes: 15,
            horizon_hours: 24,
            ..Default::default()
        };
        let now = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 1, 0, 20, 0)
            .unwrap();
        let series = pv.fetch(now).await.unwrap();
        assert_eq!(series.kind, ForecastKind::Power);
        assert_eq!(series.len(), 96);
        assert_eq!(series.anchor, SeriesAnchor::CurrentHour);
        assert_eq!(series.values[0], 0.0);
        // 11:45-12:00 and 12:00-12:15 are symmetric around noon
        assert!((series.values[47] - series.values[48]).abs() < 1e-9);
        assert!(series.values.iter().all(|v| *v >= 0.0));
    }

    #[tokio::test]
    async fn test_fetch_rejects_odd_resolution() {
        let pv = SimpleProductionForecaster {
            resolution_minutes: 45,
            ..Default::default()
        };
        let now = FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(pv.fetch(now).await.is_err());
    }
}
