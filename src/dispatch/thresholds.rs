use serde::{Deserialize, Serialize};

use super::state::HoldPolicy;
use crate::domain::{Energy, Power};
use crate::error::{DispatchError, Result};

/// Tuning values for one evaluation.
///
/// Reloaded between cycles by the configuration layer; the engine only reads them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DispatchThresholds {
    /// Absolute price gap (currency/kWh) that makes a future interval "cheaper".
    pub min_price_difference: f64,
    /// Price gap as a fraction of the current price; the larger of the two wins.
    pub min_price_difference_rel: f64,
    /// Divides the price gap while a grid-charge session is running.
    pub soften_factor: Option<f64>,
    /// Loss compensation applied to grid-charge energy, `>= 1`.
    pub charge_rate_multiplier: f64,
    pub max_grid_charge_rate: Power,
    /// PV charge cap while discharge is allowed; `None` leaves it unlimited.
    pub max_pv_charge_rate: Option<Power>,
    pub round_price_digits: u32,
    /// Lowest grid-charge power worth commanding.
    pub min_charge_rate: Power,
    /// Grid-charge deficits below this are not bought.
    pub min_recharge_amount: Energy,
    /// Upper bound on the look-ahead scan.
    pub max_horizon_intervals: usize,
    pub hold_policy: HoldPolicy,
}

impl Default for DispatchThresholds {
    fn default() -> Self {
        Self {
            min_price_difference: 0.05,
            min_price_difference_rel: 0.0,
            soften_factor: None,
            charge_rate_multiplier: 1.1,
            max_grid_charge_rate: Power::watts(5000.0),
            max_pv_charge_rate: None,
            round_price_digits: 4,
            min_charge_rate: Power::watts(500.0),
            min_recharge_amount: Energy::watt_hours(100.0),
            max_horizon_intervals: 192,
            hold_policy: HoldPolicy::default(),
        }
    }
}

impl DispatchThresholds {
    /// Copy for the coming cycle: softening only applies while a grid-charge
    /// session is in progress.
    pub fn for_cycle(&self, charging_in_progress: bool) -> Self {
        Self {
            soften_factor: self.soften_factor.filter(|_| charging_in_progress),
            ..*self
        }
    }

    pub fn validate(&self) -> Result<()> {
        check("min_price_difference", self.min_price_difference, |v| v >= 0.0)?;
        check("min_price_difference_rel", self.min_price_difference_rel, |v| v >= 0.0)?;
        if let Some(factor) = self.soften_factor {
            check("soften_factor", factor, |v| v > 0.0)?;
        }
        check("charge_rate_multiplier", self.charge_rate_multiplier, |v| v >= 1.0)?;
        check("max_grid_charge_rate", self.max_grid_charge_rate.as_watts(), |v| v >= 0.0)?;
        if let Some(rate) = self.max_pv_charge_rate {
            check("max_pv_charge_rate", rate.as_watts(), |v| v >= 0.0)?;
        }
        check("min_charge_rate", self.min_charge_rate.as_watts(), |v| v >= 0.0)?;
        check("min_recharge_amount", self.min_recharge_amount.as_watt_hours(), |v| v >= 0.0)?;
        check("round_price_digits", f64::from(self.round_price_digits), |v| v <= 10.0)?;
        check("max_horizon_intervals", self.max_horizon_intervals as f64, |v| v >= 1.0)?;
        Ok(())
    }
}

fn check(name: &'static str, value: f64, ok: impl Fn(f64) -> bool) -> Result<()> {
    if value.is_finite() && ok(value) {
        Ok(())
    } else {
        Err(DispatchError::InvalidThreshold { name, value })
    }
}
