use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};

use super::align::ForecastAligner;
use super::grid::IntervalGrid;
use super::rate::target_power;
use super::reserve::analyze;
use super::resample::InterpolationPolicy;
use super::state::{choose_mode, ModeChoice};
use super::thresholds::DispatchThresholds;
use crate::domain::{
    BatterySnapshot, DecisionTelemetry, DispatchDecision, DispatchOutcome, Energy, ForecastSeries,
};
use crate::error::Result;

/// Stateless decision core: aligned forecasts and a battery snapshot in,
/// one inverter mode out.
///
/// Holds only the grid and interpolation settings, so one engine may serve
/// any number of installations concurrently.
#[derive(Debug, Clone, Copy)]
pub struct DispatchEngine {
    aligner: ForecastAligner,
}

impl DispatchEngine {
    pub fn new(grid: IntervalGrid, interpolation: InterpolationPolicy) -> Self {
        Self {
            aligner: ForecastAligner::new(grid, interpolation),
        }
    }

    pub fn grid(&self) -> IntervalGrid {
        self.aligner.grid()
    }

    pub fn decide(
        &self,
        now: DateTime<FixedOffset>,
        production: &ForecastSeries,
        consumption: &ForecastSeries,
        prices: &ForecastSeries,
        battery: &BatterySnapshot,
        thresholds: &DispatchThresholds,
    ) -> Result<DispatchOutcome> {
        thresholds.validate()?;

        let aligned = self.aligner.align(now, production, consumption, prices)?;
        let mut degradations = aligned.degradations.clone();

        let (battery, battery_degradations) = battery.sanitized();
        degradations.extend(battery_degradations);

        let net = aligned.net_consumption();
        let reserve = analyze(&aligned.prices, &net, thresholds);
        let remaining_time_hours = aligned.position.remaining_time_hours();

        let (decision, energy_to_buy) = match choose_mode(&reserve, &battery, thresholds) {
            ModeChoice::DischargeAllowed => (
                DispatchDecision::DischargeAllowed {
                    pv_charge_limit: thresholds.max_pv_charge_rate,
                },
                Energy::ZERO,
            ),
            ModeChoice::AvoidDischarge => (DispatchDecision::AvoidDischarge, Energy::ZERO),
            ModeChoice::ChargeFromGrid { energy_to_buy } => (
                DispatchDecision::ChargeFromGrid {
                    target_power: target_power(
                        energy_to_buy,
                        remaining_time_hours,
                        self.grid().interval_hours(),
                        thresholds,
                    ),
                    energy_to_buy,
                    reserve_window: reserve.reserve_window,
                },
                energy_to_buy,
            ),
        };

        let telemetry = DecisionTelemetry {
            aligned_length: aligned.len(),
            reserve_window: reserve.reserve_window,
            current_price: reserve.current_price,
            price_threshold: reserve.threshold,
            required_reserve_energy: reserve.required_energy,
            available_energy: battery.available_energy(),
            energy_to_buy,
            remaining_time_hours,
        };

        for degradation in &degradations {
            warn!(%degradation, "degraded evaluation");
        }
        debug!(
            decision = %decision,
            soc = battery.soc,
            reserve_window = telemetry.reserve_window,
            required = %telemetry.required_reserve_energy,
            available = %telemetry.available_energy,
            "dispatch decided"
        );

        Ok(DispatchOutcome {
            decision,
            telemetry,
            degradations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatteryState, Degradation, InverterMode, Power, SocLimits};
    use crate::error::DispatchError;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(7200)
            .unwrap()
            .with_ymd_and_hms(2025, 1, 20, h, m, 0)
            .unwrap()
    }

    fn engine(minutes: u32) -> DispatchEngine {
        DispatchEngine::new(IntervalGrid::new(minutes).unwrap(), InterpolationPolicy::Linear)
    }

    fn battery(soc: f64, capacity_wh: f64) -> BatterySnapshot {
        BatterySnapshot::new(
            BatteryState {
                soc,
                capacity: Energy(capacity_wh),
                reserved_floor: Energy::ZERO,
                power: Power::ZERO,
            },
            SocLimits::default(),
        )
    }

    #[test]
    fn test_grid_charge_before_expensive_window() {
        // 15-minute grid at 10:00; cheap now, expensive next, cheap again at index 3
        let outcome = engine(15)
            .decide(
                at(10, 0),
                &ForecastSeries::energy(15, vec![0.0; 4]),
                &ForecastSeries::energy(15, vec![0.0, 400.0, 400.0, 0.0]),
                &ForecastSeries::price(15, vec![0.20, 0.40, 0.40, 0.10]),
                &battery(0.1, 2000.0),
                &DispatchThresholds::default(),
            )
            .unwrap();

        // 800 Wh required, 200 Wh stored; headroom to 80 % is 1400 Wh
        match outcome.decision {
            DispatchDecision::ChargeFromGrid {
                target_power,
                energy_to_buy,
                reserve_window,
            } => {
                assert_eq!(reserve_window, 3);
                assert_eq!(energy_to_buy, Energy(600.0));
                assert!((target_power.as_watts() - 600.0 * 1.1 / 0.25).abs() < 1e-6);
            }
            other => panic!("expected grid charge, got {other:?}"),
        }
        assert_eq!(outcome.telemetry.required_reserve_energy, Energy(800.0));
        assert_eq!(outcome.telemetry.aligned_length, 4);
    }

    #[test]
    fn test_discharge_allowed_carries_pv_limit() {
        let thresholds = DispatchThresholds {
            max_pv_charge_rate: Some(Power::watts(3000.0)),
            ..Default::default()
        };
        let outcome = engine(60)
            .decide(
                at(12, 0),
                &ForecastSeries::energy(60, vec![2000.0, 2000.0]),
                &ForecastSeries::energy(60, vec![500.0, 500.0]),
                &ForecastSeries::price(60, vec![0.30, 0.30]),
                &battery(0.5, 5000.0),
                &thresholds,
            )
            .unwrap();
        assert_eq!(
            outcome.decision,
            DispatchDecision::DischargeAllowed {
                pv_charge_limit: Some(Power::watts(3000.0))
            }
        );
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let thresholds = DispatchThresholds {
            charge_rate_multiplier: 0.5,
            ..Default::default()
        };
        let err = engine(60)
            .decide(
                at(12, 0),
                &ForecastSeries::energy(60, vec![0.0]),
                &ForecastSeries::energy(60, vec![0.0]),
                &ForecastSeries::price(60, vec![0.3]),
                &battery(0.5, 5000.0),
                &thresholds,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidThreshold { name: "charge_rate_multiplier", .. }));
    }

    #[test]
    fn test_out_of_range_soc_is_clamped_and_reported() {
        let outcome = engine(60)
            .decide(
                at(12, 0),
                &ForecastSeries::energy(60, vec![0.0]),
                &ForecastSeries::energy(60, vec![100.0]),
                &ForecastSeries::price(60, vec![0.3]),
                &battery(1.3, 5000.0),
                &DispatchThresholds::default(),
            )
            .unwrap();
        assert_eq!(outcome.decision.mode(), InverterMode::DischargeAllowed);
        assert!(outcome.degradations.contains(&Degradation::SocClamped { raw: 1.3 }));
        assert_eq!(outcome.telemetry.available_energy, Energy(5000.0));
    }

    #[test]
    fn test_crossed_soc_limits_are_lowered_before_deciding() {
        let limits = SocLimits {
            always_allow_discharge_limit: 0.5,
            max_charging_from_grid_limit: 0.8,
        };
        let snapshot = |soc: f64| {
            BatterySnapshot::new(
                BatteryState {
                    soc,
                    capacity: Energy(5000.0),
                    reserved_floor: Energy::ZERO,
                    power: Power::ZERO,
                },
                limits,
            )
        };
        let decide = |soc: f64| {
            engine(60)
                .decide(
                    at(12, 0),
                    &ForecastSeries::energy(60, vec![0.0; 3]),
                    &ForecastSeries::energy(60, vec![2000.0; 3]),
                    &ForecastSeries::price(60, vec![0.3, 0.3, 0.1]),
                    &snapshot(soc),
                    &DispatchThresholds::default(),
                )
                .unwrap()
        };

        // 4 kWh short of 3 kWh stored, but already above the lowered 0.49 grid limit
        let outcome = decide(0.6);
        assert_eq!(outcome.decision.mode(), InverterMode::DischargeAllowed);
        assert!(outcome
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::SocLimitsAdjusted { raw, .. } if *raw == 0.8)));

        // below it, grid charging stops at the lowered limit: 0.49 * 5 kWh - 2 kWh
        match decide(0.4).decision {
            DispatchDecision::ChargeFromGrid { energy_to_buy, .. } => {
                assert!((energy_to_buy.as_watt_hours() - 450.0).abs() < 1e-6);
            }
            other => panic!("expected grid charging, got {other}"),
        }
    }

    proptest! {
        #[test]
        fn prop_decide_is_idempotent(
            production in prop::collection::vec(0.0f64..3000.0, 1..24),
            consumption in prop::collection::vec(0.0f64..3000.0, 1..24),
            prices in prop::collection::vec(-0.1f64..0.8, 1..24),
            soc in 0.0f64..1.0,
            minute in 0u32..60,
        ) {
            let engine = engine(15);
            let now = at(9, minute);
            let production = ForecastSeries::energy(60, production);
            let consumption = ForecastSeries::energy(60, consumption);
            let prices = ForecastSeries::price(60, prices);
            let battery = battery(soc, 10_000.0);
            let thresholds = DispatchThresholds::default();

            let first = engine.decide(now, &production, &consumption, &prices, &battery, &thresholds);
            let second = engine.decide(now, &production, &consumption, &prices, &battery, &thresholds);
            prop_assert_eq!(&first, &second);
            if let Ok(outcome) = first {
                let target = outcome.decision.target_power().unwrap_or(Power::ZERO);
                prop_assert!(target.as_watts() >= 0.0);
                prop_assert!(target <= thresholds.max_grid_charge_rate);
                prop_assert!(outcome.telemetry.reserve_window >= 1);
                prop_assert!(outcome.telemetry.reserve_window <= outcome.telemetry.aligned_length);
            }
        }
    }
}
