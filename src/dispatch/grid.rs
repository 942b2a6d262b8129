use chrono::{DateTime, FixedOffset, TimeDelta, Timelike};

use crate::error::{DispatchError, Result};

/// Common time resolution of one evaluation.
///
/// Intervals are aligned to the top of the hour, so the length must divide 60.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGrid {
    interval_minutes: u32,
}

/// Where "now" sits inside the current interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalPosition {
    /// Start of the effective current interval (index 0).
    pub start: DateTime<FixedOffset>,
    /// Fraction of index 0 already elapsed, in `[0, 1)`.
    pub elapsed_fraction: f64,
    /// True when "now" sat on the end of its interval and index 0 moved to the next one.
    pub rolled: bool,
    interval_minutes: u32,
}

impl IntervalPosition {
    /// Hours left in the effective current interval; always positive.
    pub fn remaining_time_hours(&self) -> f64 {
        f64::from(self.interval_minutes) * (1.0 - self.elapsed_fraction) / 60.0
    }
}

impl IntervalGrid {
    pub fn new(interval_minutes: u32) -> Result<Self> {
        if interval_minutes == 0 || 60 % interval_minutes != 0 {
            return Err(DispatchError::InvalidTime(format!(
                "interval length must be a positive divisor of 60 minutes, got {interval_minutes}"
            )));
        }
        Ok(Self { interval_minutes })
    }

    pub fn from_duration(interval: TimeDelta) -> Result<Self> {
        if interval <= TimeDelta::zero() {
            return Err(DispatchError::InvalidTime(format!(
                "interval length must be positive, got {interval}"
            )));
        }
        if interval.num_seconds() % 60 != 0 || interval.subsec_nanos() != 0 {
            return Err(DispatchError::InvalidTime(format!(
                "interval length must be whole minutes, got {interval}"
            )));
        }
        let minutes = u32::try_from(interval.num_minutes())
            .map_err(|_| DispatchError::InvalidTime(format!("interval too long: {interval}")))?;
        Self::new(minutes)
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    pub fn interval_hours(&self) -> f64 {
        f64::from(self.interval_minutes) / 60.0
    }

    /// Number of whole grid intervals between the top of the hour and index 0.
    pub fn intervals_into_hour(&self, now: DateTime<FixedOffset>) -> usize {
        let position = self.position(now);
        let minute = position.start.minute();
        (minute / self.interval_minutes) as usize
    }

    pub fn position(&self, now: DateTime<FixedOffset>) -> IntervalPosition {
        let interval_secs = self.interval_minutes * 60;
        let secs_into_hour = now.minute() * 60 + now.second();
        let secs_into_interval = secs_into_hour % interval_secs;
        // chrono encodes a leap second as nanos >= 1e9
        let nanos = f64::from(now.nanosecond()) / 1e9;
        let fraction = (f64::from(secs_into_interval) + nanos) / f64::from(interval_secs);

        let start = now.with_nanosecond(0).unwrap_or(now)
            - TimeDelta::seconds(i64::from(secs_into_interval));

        if fraction >= 1.0 {
            return IntervalPosition {
                start: start + TimeDelta::minutes(i64::from(self.interval_minutes)),
                elapsed_fraction: 0.0,
                rolled: true,
                interval_minutes: self.interval_minutes,
            };
        }

        IntervalPosition {
            start,
            elapsed_fraction: fraction,
            rolled: false,
            interval_minutes: self.interval_minutes,
        }
    }

    pub fn elapsed_fraction(&self, now: DateTime<FixedOffset>) -> f64 {
        self.position(now).elapsed_fraction
    }

    pub fn remaining_time_hours(&self, now: DateTime<FixedOffset>) -> f64 {
        self.position(now).remaining_time_hours()
    }
}

/// Fraction of the interval containing `now` that has already elapsed.
pub fn elapsed_fraction(now: DateTime<FixedOffset>, interval_length: TimeDelta) -> Result<f64> {
    Ok(IntervalGrid::from_duration(interval_length)?.elapsed_fraction(now))
}

/// Hours left until the end of the interval containing `now`.
pub fn remaining_time_hours(now: DateTime<FixedOffset>, interval_length: TimeDelta) -> Result<f64> {
    Ok(IntervalGrid::from_duration(interval_length)?.remaining_time_hours(now))
}
