use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Energy, Power, Price};

/// Inverter mode requested for the current interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InverterMode {
    DischargeAllowed,
    AvoidDischarge,
    ChargeFromGrid,
}

/// What the inverter driver should do until the next evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchDecision {
    /// Free to discharge for direct consumption; PV surplus charges the
    /// battery up to `pv_charge_limit` (unlimited when `None`).
    DischargeAllowed { pv_charge_limit: Option<Power> },
    /// Keep stored energy for a more expensive window; PV surplus may still charge.
    AvoidDischarge,
    ChargeFromGrid {
        target_power: Power,
        energy_to_buy: Energy,
        reserve_window: usize,
    },
}

impl Default for DispatchDecision {
    fn default() -> Self {
        Self::DischargeAllowed {
            pv_charge_limit: None,
        }
    }
}

impl DispatchDecision {
    pub fn mode(&self) -> InverterMode {
        match self {
            Self::DischargeAllowed { .. } => InverterMode::DischargeAllowed,
            Self::AvoidDischarge => InverterMode::AvoidDischarge,
            Self::ChargeFromGrid { .. } => InverterMode::ChargeFromGrid,
        }
    }

    pub fn target_power(&self) -> Option<Power> {
        match self {
            Self::ChargeFromGrid { target_power, .. } => Some(*target_power),
            _ => None,
        }
    }
}

impl std::fmt::Display for DispatchDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChargeFromGrid { target_power, .. } => {
                write!(f, "{} @ {}", self.mode(), target_power)
            }
            _ => write!(f, "{}", self.mode()),
        }
    }
}

/// Intermediate values of one evaluation, exposed for observability only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DecisionTelemetry {
    pub aligned_length: usize,
    pub reserve_window: usize,
    pub current_price: Price,
    pub price_threshold: f64,
    pub required_reserve_energy: Energy,
    pub available_energy: Energy,
    pub energy_to_buy: Energy,
    pub remaining_time_hours: f64,
}

/// Non-fatal findings of an evaluation.
///
/// The engine still returns a decision; these are logged and forwarded so an
/// operator can spot upstream provider problems.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Linear or smooth interpolation needs at least two points.
    InterpolationFallback {
        role: &'static str,
        requested: String,
        len: usize,
    },
    /// Negative energies were floored at zero.
    NegativeEnergyClamped { role: &'static str, count: usize },
    /// SOC outside `[0, 1]` was clamped.
    SocClamped { raw: f64 },
    /// `max_charging_from_grid_limit` sat above `always_allow_discharge_limit` and was lowered.
    SocLimitsAdjusted { raw: f64, lowered: f64 },
    /// Elapsed native slots were padded with the index-0 value to hour-align a series.
    CurrentIntervalPadded { role: &'static str, slots: usize },
    /// "Now" landed on the end of the current interval; interval 1 became current.
    RolledToNextInterval,
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InterpolationFallback { role, requested, len } => write!(
                f,
                "{role}: {requested} interpolation needs 2+ points, got {len}; used constant"
            ),
            Self::NegativeEnergyClamped { role, count } => {
                write!(f, "{role}: {count} negative energies floored at 0")
            }
            Self::SocClamped { raw } => write!(f, "SOC {raw} clamped to [0, 1]"),
            Self::SocLimitsAdjusted { raw, lowered } => write!(
                f,
                "max_charging_from_grid_limit {raw} above always_allow_discharge_limit; lowered to {lowered}"
            ),
            Self::CurrentIntervalPadded { role, slots } => {
                write!(f, "{role}: padded {slots} elapsed slots to align to the hour")
            }
            Self::RolledToNextInterval => write!(f, "rolled to next interval"),
        }
    }
}

/// Decision plus everything that led to it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchOutcome {
    pub decision: DispatchDecision,
    pub telemetry: DecisionTelemetry,
    pub degradations: Vec<Degradation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_mapping() {
        let decision = DispatchDecision::ChargeFromGrid {
            target_power: Power::watts(1320.0),
            energy_to_buy: Energy::watt_hours(300.0),
            reserve_window: 2,
        };
        assert_eq!(decision.mode(), InverterMode::ChargeFromGrid);
        assert_eq!(decision.target_power(), Some(Power::watts(1320.0)));
        assert_eq!(DispatchDecision::AvoidDischarge.target_power(), None);
        assert_eq!(DispatchDecision::default().mode(), InverterMode::DischargeAllowed);
    }

    #[test]
    fn test_decision_serializes_with_mode_tag() {
        let json = serde_json::to_value(DispatchDecision::AvoidDischarge).unwrap();
        assert_eq!(json["mode"], "avoid_discharge");

        let json = serde_json::to_value(DispatchDecision::ChargeFromGrid {
            target_power: Power::watts(500.0),
            energy_to_buy: Energy::watt_hours(120.0),
            reserve_window: 3,
        })
        .unwrap();
        assert_eq!(json["mode"], "charge_from_grid");
        assert_eq!(json["reserve_window"], 3);
    }

    #[test]
    fn test_display() {
        let decision = DispatchDecision::ChargeFromGrid {
            target_power: Power::watts(2500.0),
            energy_to_buy: Energy::watt_hours(600.0),
            reserve_window: 4,
        };
        assert_eq!(decision.to_string(), "charge_from_grid @ 2.50 kW");
        assert_eq!(InverterMode::AvoidDischarge.to_string(), "avoid_discharge");
    }
}
