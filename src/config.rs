use anyhow::{ensure, Context, Result};
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use validator::Validate;

use crate::dispatch::{DispatchThresholds, HoldPolicy, IntervalGrid, InterpolationPolicy};
use crate::domain::{BatteryState, Energy, Power, SocLimits};
use crate::forecast::{SimpleConsumptionForecaster, SimpleProductionForecaster, TariffZonesPriceProvider};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub battery_control: BatteryControlConfig,
    #[validate(nested)]
    pub battery_control_expert: BatteryControlExpertConfig,
    #[validate(nested)]
    pub forecasts: ForecastsConfig,
    #[validate(nested)]
    pub battery: BatteryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    pub interval_minutes: u32,
    #[validate(range(min = 1))]
    pub max_horizon_intervals: usize,
    /// IANA name, e.g. `Europe/Berlin`.
    pub timezone: String,
    /// How long the last mode is kept after forecasts start failing.
    #[validate(range(max = 86400))]
    pub error_hold_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 180,
            interval_minutes: 60,
            max_horizon_intervals: 192,
            timezone: "Europe/Berlin".to_string(),
            error_hold_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryControlConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub always_allow_discharge_limit: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_charging_from_grid_limit: f64,
    #[validate(range(min = 0.0))]
    pub min_price_difference: f64,
    #[validate(range(min = 0.0))]
    pub min_price_difference_rel: f64,
    #[validate(range(min = 1.0))]
    pub charge_rate_multiplier: f64,
    /// W
    #[validate(range(min = 0.0))]
    pub max_grid_charge_rate: f64,
    /// W; unset means unlimited.
    #[validate(range(min = 0.0))]
    pub max_pv_charge_rate: Option<f64>,
    /// Wh
    #[validate(range(min = 0.0))]
    pub min_recharge_amount: f64,
}

impl Default for BatteryControlConfig {
    fn default() -> Self {
        Self {
            always_allow_discharge_limit: 0.9,
            max_charging_from_grid_limit: 0.8,
            min_price_difference: 0.05,
            min_price_difference_rel: 0.0,
            charge_rate_multiplier: 1.1,
            max_grid_charge_rate: 5000.0,
            max_pv_charge_rate: None,
            min_recharge_amount: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryControlExpertConfig {
    #[validate(range(max = 10))]
    pub round_price_digits: u32,
    pub soften_price_difference_on_charging: bool,
    #[validate(range(exclusive_min = 0.0))]
    pub soften_price_difference_on_charging_factor: f64,
    /// W
    #[validate(range(min = 0.0))]
    pub min_charge_rate: f64,
    pub hold_policy: HoldPolicy,
}

impl Default for BatteryControlExpertConfig {
    fn default() -> Self {
        Self {
            round_price_digits: 4,
            soften_price_difference_on_charging: false,
            soften_price_difference_on_charging_factor: 5.0,
            min_charge_rate: 500.0,
            hold_policy: HoldPolicy::ReserveWindow,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ForecastsConfig {
    pub interpolation: InterpolationPolicy,
    #[validate(nested)]
    pub production: ProductionConfig,
    #[validate(nested)]
    pub consumption: ConsumptionConfig,
    #[validate(nested)]
    pub tariff: TariffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProductionConfig {
    #[validate(range(min = 0.0))]
    pub peak_w: f64,
    #[validate(range(min = 0.0, max = 24.0))]
    pub sunrise: f64,
    #[validate(range(min = 0.0, max = 24.0))]
    pub sunset: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub cloud_factor: f64,
    pub resolution_minutes: u32,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            peak_w: 3500.0,
            sunrise: 8.0,
            sunset: 16.0,
            cloud_factor: 0.75,
            resolution_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumptionConfig {
    #[validate(range(min = 0.0))]
    pub base_w: f64,
    #[validate(range(min = 0.0))]
    pub morning_w: f64,
    #[validate(range(min = 0.0))]
    pub evening_w: f64,
    pub resolution_minutes: u32,
}

impl Default for ConsumptionConfig {
    fn default() -> Self {
        Self {
            base_w: 600.0,
            morning_w: 1000.0,
            evening_w: 1600.0,
            resolution_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TariffConfig {
    pub zone_1_price: f64,
    pub zone_2_price: f64,
    #[validate(range(max = 23))]
    pub zone_1_start: u32,
    #[validate(range(max = 23))]
    pub zone_1_end: u32,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            zone_1_price: 0.32,
            zone_2_price: 0.22,
            zone_1_start: 7,
            zone_1_end: 22,
        }
    }
}

/// Simulated installation driven by the binary.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryConfig {
    #[validate(range(exclusive_min = 0.0))]
    pub capacity_wh: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub initial_soc: f64,
    #[validate(range(min = 0.0))]
    pub reserved_floor_wh: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_wh: 10_000.0,
            initial_soc: 0.5,
            reserved_floor_wh: 500.0,
        }
    }
}

fn ensure_divides_hour(name: &str, minutes: u32) -> Result<()> {
    ensure!(
        minutes > 0 && 60 % minutes == 0,
        "{name} must be a positive divisor of 60 minutes, got {minutes}"
    );
    Ok(())
}

impl Config {
    /// Loads `config/default.toml`, then the file named by `DISPATCH_CONFIG`,
    /// then `DISPATCH__`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"));
        if let Ok(path) = std::env::var("DISPATCH_CONFIG") {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("DISPATCH__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut cfg: Config = figment.extract().context("invalid configuration")?;
        cfg.validate().context("configuration out of range")?;
        cfg.cross_check()?;
        cfg.normalize();
        Ok(cfg)
    }

    fn cross_check(&self) -> Result<()> {
        ensure_divides_hour("controller.interval_minutes", self.controller.interval_minutes)?;
        ensure_divides_hour(
            "forecasts.production.resolution_minutes",
            self.forecasts.production.resolution_minutes,
        )?;
        ensure_divides_hour(
            "forecasts.consumption.resolution_minutes",
            self.forecasts.consumption.resolution_minutes,
        )?;
        ensure!(
            self.forecasts.production.sunrise < self.forecasts.production.sunset,
            "forecasts.production.sunrise must be before sunset"
        );
        self.timezone()?;
        Ok(())
    }

    /// Keeps the grid-charge limit below the always-discharge limit so the
    /// two rules never fight over the same SOC band.
    fn normalize(&mut self) {
        let (limits, lowered) = self.soc_limits().normalized();
        if lowered {
            warn!(
                always_allow_discharge_limit = limits.always_allow_discharge_limit,
                max_charging_from_grid_limit = self.battery_control.max_charging_from_grid_limit,
                lowered = limits.max_charging_from_grid_limit,
                "max_charging_from_grid_limit above always_allow_discharge_limit, lowering it"
            );
            self.battery_control.max_charging_from_grid_limit = limits.max_charging_from_grid_limit;
        }
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.controller
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("unknown timezone {}: {e}", self.controller.timezone))
    }

    pub fn grid(&self) -> Result<IntervalGrid> {
        Ok(IntervalGrid::new(self.controller.interval_minutes)?)
    }

    pub fn soc_limits(&self) -> SocLimits {
        SocLimits {
            always_allow_discharge_limit: self.battery_control.always_allow_discharge_limit,
            max_charging_from_grid_limit: self.battery_control.max_charging_from_grid_limit,
        }
    }

    pub fn thresholds(&self) -> DispatchThresholds {
        let bc = &self.battery_control;
        let expert = &self.battery_control_expert;
        DispatchThresholds {
            min_price_difference: bc.min_price_difference,
            min_price_difference_rel: bc.min_price_difference_rel,
            soften_factor: expert
                .soften_price_difference_on_charging
                .then_some(expert.soften_price_difference_on_charging_factor),
            charge_rate_multiplier: bc.charge_rate_multiplier,
            max_grid_charge_rate: Power::watts(bc.max_grid_charge_rate),
            max_pv_charge_rate: bc.max_pv_charge_rate.map(Power::watts),
            round_price_digits: expert.round_price_digits,
            min_charge_rate: Power::watts(expert.min_charge_rate),
            min_recharge_amount: Energy::watt_hours(bc.min_recharge_amount),
            max_horizon_intervals: self.controller.max_horizon_intervals,
            hold_policy: expert.hold_policy,
        }
    }

    pub fn initial_battery_state(&self) -> BatteryState {
        BatteryState {
            soc: self.battery.initial_soc,
            capacity: Energy::watt_hours(self.battery.capacity_wh),
            reserved_floor: Energy::watt_hours(self.battery.reserved_floor_wh),
            power: Power::ZERO,
        }
    }

    pub fn production_forecaster(&self) -> Result<SimpleProductionForecaster> {
        let p = &self.forecasts.production;
        Ok(SimpleProductionForecaster {
            peak_w: p.peak_w,
            sunrise: p.sunrise,
            sunset: p.sunset,
            cloud_factor: p.cloud_factor,
            resolution_minutes: p.resolution_minutes,
            horizon_hours: 48,
            timezone: self.timezone()?,
        })
    }

    pub fn consumption_forecaster(&self) -> Result<SimpleConsumptionForecaster> {
        let c = &self.forecasts.consumption;
        Ok(SimpleConsumptionForecaster {
            base_w: c.base_w,
            morning_w: c.morning_w,
            evening_w: c.evening_w,
            resolution_minutes: c.resolution_minutes,
            horizon_hours: 48,
            timezone: self.timezone()?,
        })
    }

    pub fn tariff_provider(&self) -> Result<TariffZonesPriceProvider> {
        let t = &self.forecasts.tariff;
        TariffZonesPriceProvider::new(
            t.zone_1_price,
            t.zone_2_price,
            t.zone_1_start,
            t.zone_1_end,
            self.timezone()?,
        )
    }
}
