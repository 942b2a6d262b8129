pub mod consumption;
pub mod engine;
pub mod prices;
pub mod production;

pub use consumption::*;
pub use engine::*;
pub use prices::*;
pub use production::*;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Timelike};
use chrono_tz::Tz;

use crate::domain::{ForecastKind, ForecastSeries, SeriesAnchor};

/// A source of one forecast at its own native resolution.
///
/// Providers only fetch; conversion onto the decision grid happens in the
/// dispatch core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Minutes covered by one value of the returned series.
    fn native_resolution(&self) -> u32;
    fn kind(&self) -> ForecastKind;
    fn anchor(&self) -> SeriesAnchor;
    async fn fetch(&self, now: DateTime<FixedOffset>) -> Result<ForecastSeries>;
}

/// Start of the native interval containing `now`, in local time.
pub(crate) fn local_interval_start(
    now: DateTime<FixedOffset>,
    tz: Tz,
    resolution_minutes: u32,
) -> Result<DateTime<Tz>> {
    let local = now.with_timezone(&tz);
    let minute = local.minute() - local.minute() % resolution_minutes.clamp(1, 60);
    local
        .with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .with_context(|| format!("cannot truncate {local} to {resolution_minutes} minutes"))
}

/// Fractional local hour of day, e.g. 7.5 for 07:30.
pub(crate) fn hour_of_day<T: Timelike>(t: &T) -> f64 {
    f64::from(t.hour()) + f64::from(t.minute()) / 60.0
}
