use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Degradation, DispatchDecision, Energy, InverterMode, Power};
use crate::error::DispatchError;

/// Inverter driver errors
#[derive(Debug, Error)]
pub enum InverterError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Invalid charge power: {0}W (exceeds limits)")]
    InvalidPower(f64),
    #[error("Inverter offline or unavailable")]
    Offline,
}

/// Physical battery state as reported by the inverter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BatteryState {
    /// Fraction in `[0, 1]`.
    pub soc: f64,
    pub capacity: Energy,
    /// Backup reserve below which the inverter never discharges.
    pub reserved_floor: Energy,
    pub power: Power,
}

/// SOC thresholds that gate grid charging and discharge holding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SocLimits {
    pub always_allow_discharge_limit: f64,
    pub max_charging_from_grid_limit: f64,
}

impl Default for SocLimits {
    fn default() -> Self {
        Self {
            always_allow_discharge_limit: 0.9,
            max_charging_from_grid_limit: 0.8,
        }
    }
}

impl SocLimits {
    /// Both limits must be fractions in `[0, 1]`.
    pub fn validate(&self) -> Result<(), DispatchError> {
        for (name, value) in [
            ("always_allow_discharge_limit", self.always_allow_discharge_limit),
            ("max_charging_from_grid_limit", self.max_charging_from_grid_limit),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DispatchError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }

    /// Keeps the grid-charge limit below the always-discharge limit.
    ///
    /// Returns the limits to use and whether the grid-charge limit was lowered.
    pub fn normalized(self) -> (Self, bool) {
        if self.always_allow_discharge_limit >= self.max_charging_from_grid_limit {
            return (self, false);
        }
        let lowered = (self.always_allow_discharge_limit - 0.01).max(0.0);
        (
            Self {
                max_charging_from_grid_limit: lowered,
                ..self
            },
            true,
        )
    }
}

/// Battery view handed to the engine for one evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BatterySnapshot {
    pub soc: f64,
    pub capacity: Energy,
    pub reserved_floor: Energy,
    pub always_allow_discharge_limit: f64,
    pub max_charging_from_grid_limit: f64,
    /// Set by an external collaborator (e.g. an EV charging session) to hold the battery.
    pub discharge_blocked: bool,
}

impl BatterySnapshot {
    pub fn new(state: BatteryState, limits: SocLimits) -> Self {
        Self {
            soc: state.soc,
            capacity: state.capacity,
            reserved_floor: state.reserved_floor,
            always_allow_discharge_limit: limits.always_allow_discharge_limit,
            max_charging_from_grid_limit: limits.max_charging_from_grid_limit,
            discharge_blocked: false,
        }
    }

    pub fn limits(&self) -> SocLimits {
        SocLimits {
            always_allow_discharge_limit: self.always_allow_discharge_limit,
            max_charging_from_grid_limit: self.max_charging_from_grid_limit,
        }
    }

    pub fn with_discharge_blocked(mut self, blocked: bool) -> Self {
        self.discharge_blocked = blocked;
        self
    }

    /// Clamps SOC into `[0, 1]`, negative capacities to zero and lowers a
    /// grid-charge limit that sits above the always-discharge limit.
    ///
    /// Upstream bugs must not abort a live control loop, so this reports the
    /// corrections instead of failing.
    pub fn sanitized(self) -> (Self, Vec<Degradation>) {
        let mut degradations = Vec::new();

        let soc = if self.soc.is_finite() { self.soc.clamp(0.0, 1.0) } else { 0.0 };
        if soc != self.soc {
            degradations.push(Degradation::SocClamped { raw: self.soc });
        }

        let (limits, lowered) = self.limits().normalized();
        if lowered {
            degradations.push(Degradation::SocLimitsAdjusted {
                raw: self.max_charging_from_grid_limit,
                lowered: limits.max_charging_from_grid_limit,
            });
        }

        (
            Self {
                soc,
                capacity: self.capacity.non_negative(),
                reserved_floor: self.reserved_floor.non_negative(),
                max_charging_from_grid_limit: limits.max_charging_from_grid_limit,
                ..self
            },
            degradations,
        )
    }

    pub fn stored_energy(&self) -> Energy {
        Energy(self.soc * self.capacity.0)
    }

    /// Stored energy above the backup reserve floor.
    pub fn available_energy(&self) -> Energy {
        (self.stored_energy() - self.reserved_floor).non_negative()
    }

    pub fn free_capacity(&self) -> Energy {
        (self.capacity - self.stored_energy()).non_negative()
    }

    /// Energy that may still be bought before `max_charging_from_grid_limit` is reached.
    pub fn grid_charge_headroom(&self) -> Energy {
        (Energy(self.capacity.0 * self.max_charging_from_grid_limit) - self.stored_energy())
            .non_negative()
    }

    pub fn is_discharge_always_allowed(&self) -> bool {
        self.soc >= self.always_allow_discharge_limit
    }

    pub fn is_grid_charging_allowed(&self) -> bool {
        self.soc < self.max_charging_from_grid_limit
    }
}

/// Driver for the physical inverter.
///
/// Implementations own retry and backoff on the device link.
#[async_trait]
pub trait Inverter: Send + Sync {
    async fn read_state(&self) -> Result<BatteryState>;
    async fn apply(&self, decision: &DispatchDecision) -> Result<()>;
    async fn current_mode(&self) -> Option<InverterMode>;
}

/// Inverter that integrates commanded power into its own SOC.
#[derive(Debug)]
pub struct SimulatedInverter {
    state: Arc<RwLock<BatteryState>>,
    mode: Arc<RwLock<Option<InverterMode>>>,
    /// Hours each applied command is assumed to run for.
    pub step_hours: f64,
    pub max_grid_charge_rate: Power,
    pub efficiency: f64,
    /// Load the pack covers while discharge is allowed.
    pub house_load: Power,
}

impl SimulatedInverter {
    pub fn new(initial: BatteryState, max_grid_charge_rate: Power, step_hours: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
            mode: Arc::new(RwLock::new(None)),
            step_hours,
            max_grid_charge_rate,
            efficiency: 0.95,
            house_load: Power::ZERO,
        }
    }

    pub fn with_house_load(mut self, load: Power) -> Self {
        self.house_load = load.max(Power::ZERO);
        self
    }

    pub async fn snapshot(&self) -> BatteryState {
        *self.state.read().await
    }
}

#[async_trait]
impl Inverter for SimulatedInverter {
    async fn read_state(&self) -> Result<BatteryState> {
        Ok(*self.state.read().await)
    }

    async fn apply(&self, decision: &DispatchDecision) -> Result<()> {
        let mut st = self.state.write().await;
        let cap_wh = st.capacity.as_watt_hours().max(0.1);

        st.power = match decision {
            DispatchDecision::ChargeFromGrid { target_power, .. } => {
                if target_power.as_watts() > self.max_grid_charge_rate.as_watts() {
                    return Err(InverterError::InvalidPower(target_power.as_watts()).into());
                }
                // AC power * efficiency = DC energy stored
                let stored = target_power.over_hours(self.step_hours).as_watt_hours() * self.efficiency;
                st.soc = (st.soc + stored / cap_wh).clamp(0.0, 1.0);
                *target_power
            }
            DispatchDecision::DischargeAllowed { .. } => {
                // DC energy drawn = AC load / efficiency, never below the reserved floor
                let floor = (st.reserved_floor.as_watt_hours() / cap_wh).clamp(0.0, 1.0);
                let wanted = self.house_load.over_hours(self.step_hours).as_watt_hours() / self.efficiency;
                let drawn = (wanted / cap_wh).min((st.soc - floor).max(0.0));
                st.soc -= drawn;
                Power::watts(-drawn * cap_wh * self.efficiency / self.step_hours.max(f64::EPSILON))
            }
            DispatchDecision::AvoidDischarge => Power::ZERO,
        };

        let mode = decision.mode();
        let previous = self.mode.write().await.replace(mode);
        if previous != Some(mode) {
            info!(mode = %mode, soc = st.soc, "simulated inverter mode change");
        } else {
            debug!(mode = %mode, soc = st.soc, "simulated inverter mode unchanged");
        }
        Ok(())
    }

    async fn current_mode(&self) -> Option<InverterMode> {
        *self.mode.read().await
    }
}

/// Inverter that replays queued states and records every applied decision.
pub struct MockInverter {
    pub states: Arc<RwLock<VecDeque<BatteryState>>>,
    pub applied: Arc<RwLock<Vec<DispatchDecision>>>,
    fallback: BatteryState,
}

impl MockInverter {
    pub fn new(states: VecDeque<BatteryState>, fallback: BatteryState) -> Self {
        Self {
            states: Arc::new(RwLock::new(states)),
            applied: Arc::new(RwLock::new(Vec::new())),
            fallback,
        }
    }

    pub async fn applied(&self) -> Vec<DispatchDecision> {
        self.applied.read().await.clone()
    }
}

#[async_trait]
impl Inverter for MockInverter {
    async fn read_state(&self) -> Result<BatteryState> {
        let mut q = self.states.write().await;
        Ok(q.pop_front().unwrap_or(self.fallback))
    }

    async fn apply(&self, decision: &DispatchDecision) -> Result<()> {
        self.applied.write().await.push(*decision);
        Ok(())
    }

    async fn current_mode(&self) -> Option<InverterMode> {
        self.applied.read().await.last().map(DispatchDecision::mode)
    }
}
