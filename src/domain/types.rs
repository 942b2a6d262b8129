use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Sub};

// ============================================================================
// Physical Unit Newtypes
// ============================================================================

/// Power in Watts (W)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Power(pub f64);

impl Power {
    pub const ZERO: Self = Self(0.0);

    pub fn watts(w: f64) -> Self {
        Self(w)
    }

    pub fn kilowatts(kw: f64) -> Self {
        Self(kw * 1000.0)
    }

    pub fn as_watts(&self) -> f64 {
        self.0
    }

    pub fn as_kilowatts(&self) -> f64 {
        self.0 / 1000.0
    }

    /// Energy delivered when this power is held for `hours`.
    pub fn over_hours(self, hours: f64) -> Energy {
        Energy(self.0 * hours)
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl std::fmt::Display for Power {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.abs() >= 1000.0 {
            write!(f, "{:.2} kW", self.as_kilowatts())
        } else {
            write!(f, "{:.1} W", self.0)
        }
    }
}

impl Add for Power {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Power {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Energy in Watt-hours (Wh)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Energy(pub f64);

impl Energy {
    pub const ZERO: Self = Self(0.0);

    pub fn watt_hours(wh: f64) -> Self {
        Self(wh)
    }

    pub fn kilowatt_hours(kwh: f64) -> Self {
        Self(kwh * 1000.0)
    }

    pub fn as_watt_hours(&self) -> f64 {
        self.0
    }

    pub fn as_kilowatt_hours(&self) -> f64 {
        self.0 / 1000.0
    }

    /// Average power needed to move this energy within `hours`.
    ///
    /// `hours` must be positive; callers guard the zero case.
    pub fn per_hours(self, hours: f64) -> Power {
        Power(self.0 / hours)
    }

    /// Floors negative values at zero.
    pub fn non_negative(self) -> Self {
        Self(self.0.max(0.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl std::fmt::Display for Energy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.abs() >= 1000.0 {
            write!(f, "{:.2} kWh", self.as_kilowatt_hours())
        } else {
            write!(f, "{:.1} Wh", self.0)
        }
    }
}

impl Add for Energy {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Energy {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Energy {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Energy {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|e| e.0).sum())
    }
}

/// Price in currency units per kilowatt-hour.
///
/// The currency is whatever the tariff provider delivers; the engine only
/// compares prices with each other.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Price(pub f64);

impl Price {
    pub fn per_kwh(price: f64) -> Self {
        Self(price)
    }

    pub fn as_per_kwh(&self) -> f64 {
        self.0
    }

    /// Rounds to `digits` decimal places, half away from zero.
    pub fn rounded(self, digits: u32) -> Self {
        Self(round_to(self.0, digits))
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}/kWh", self.0)
    }
}

impl Sub for Price {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

pub(crate) fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits.min(15) as i32);
    (value * factor).round() / factor
}
