use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use super::reserve::ReserveAnalysis;
use super::thresholds::DispatchThresholds;
use crate::domain::{BatterySnapshot, Energy};

/// When a sufficient battery is held back instead of discharged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HoldPolicy {
    /// Hold whenever a cheaper interval ends the window and the window has deficits.
    #[default]
    ReserveWindow,
    /// Additionally require an interval inside the window priced above the current one.
    RequirePriceRise,
}

/// Mode chosen for the running interval, before the charge rate is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeChoice {
    DischargeAllowed,
    AvoidDischarge,
    ChargeFromGrid { energy_to_buy: Energy },
}

/// Picks the inverter mode from the reserve requirement and the battery.
pub fn choose_mode(
    reserve: &ReserveAnalysis,
    battery: &BatterySnapshot,
    thresholds: &DispatchThresholds,
) -> ModeChoice {
    let choice = base_choice(reserve, battery, thresholds);

    // an external consumer (e.g. an EV session) may pin the battery
    if battery.discharge_blocked
        && choice == ModeChoice::DischargeAllowed
        && !battery.is_discharge_always_allowed()
    {
        debug!("discharge blocked externally");
        return ModeChoice::AvoidDischarge;
    }
    choice
}

fn base_choice(
    reserve: &ReserveAnalysis,
    battery: &BatterySnapshot,
    thresholds: &DispatchThresholds,
) -> ModeChoice {
    if battery.is_discharge_always_allowed() {
        debug!(soc = battery.soc, "discharge allowed above always_allow_discharge_limit");
        return ModeChoice::DischargeAllowed;
    }

    let required = reserve.required_energy;
    let available = battery.available_energy();

    if required <= available {
        let hold = reserve.cheaper_price_ahead
            && required.as_watt_hours() > 0.0
            && match thresholds.hold_policy {
                HoldPolicy::ReserveWindow => true,
                HoldPolicy::RequirePriceRise => reserve.price_rise_ahead,
            };
        debug!(%required, %available, hold, "stored energy covers reserve");
        return if hold {
            ModeChoice::AvoidDischarge
        } else {
            ModeChoice::DischargeAllowed
        };
    }

    if !battery.is_grid_charging_allowed() {
        debug!(
            soc = battery.soc,
            %required,
            %available,
            "reserve short but above max_charging_from_grid_limit"
        );
        return ModeChoice::DischargeAllowed;
    }

    let deficit = required - available;
    let energy_to_buy = deficit
        .min(battery.grid_charge_headroom())
        .min(battery.free_capacity());

    if energy_to_buy < thresholds.min_recharge_amount || energy_to_buy.as_watt_hours() <= 0.0 {
        debug!(
            %deficit,
            %energy_to_buy,
            min = %thresholds.min_recharge_amount,
            "grid charge below minimum recharge amount, holding"
        );
        return ModeChoice::AvoidDischarge;
    }

    debug!(%deficit, %energy_to_buy, "grid charge required");
    ModeChoice::ChargeFromGrid { energy_to_buy }
}
