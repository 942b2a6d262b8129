use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use chrono_tz::Tz;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::{DispatchEngine, DispatchThresholds};
use crate::domain::{BatterySnapshot, DispatchDecision, DispatchOutcome, Inverter, InverterMode, SocLimits};
use crate::error::DispatchError;
use crate::forecast::ForecastEngine;
use crate::telemetry::{CycleReport, CycleStatus, DecisionSink};

/// Per-installation settings of the control loop.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub thresholds: DispatchThresholds,
    pub limits: SocLimits,
    /// How long the last mode is kept while evaluations fail.
    pub error_hold: TimeDelta,
    pub timezone: Tz,
}

/// Serializes fetch, decide and command for one installation.
pub struct DispatchController {
    engine: DispatchEngine,
    forecasts: Arc<ForecastEngine>,
    inverter: Arc<dyn Inverter>,
    sink: Arc<dyn DecisionSink>,
    thresholds: RwLock<DispatchThresholds>,
    limits: RwLock<SocLimits>,
    error_hold: TimeDelta,
    timezone: Tz,
    discharge_blocked: AtomicBool,
    /// Set by a manual override; the next evaluation leaves the inverter alone.
    skip_next: AtomicBool,
    first_error_at: Mutex<Option<DateTime<FixedOffset>>>,
    cycle: Mutex<()>,
}

impl DispatchController {
    pub fn new(
        engine: DispatchEngine,
        forecasts: Arc<ForecastEngine>,
        inverter: Arc<dyn Inverter>,
        sink: Arc<dyn DecisionSink>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            engine,
            forecasts,
            inverter,
            sink,
            thresholds: RwLock::new(settings.thresholds),
            limits: RwLock::new(settings.limits.normalized().0),
            error_hold: settings.error_hold,
            timezone: settings.timezone,
            discharge_blocked: AtomicBool::new(false),
            skip_next: AtomicBool::new(false),
            first_error_at: Mutex::new(None),
            cycle: Mutex::new(()),
        }
    }

    /// Wires the offline providers described by `cfg` to `inverter`.
    pub fn from_config(cfg: &Config, inverter: Arc<dyn Inverter>, sink: Arc<dyn DecisionSink>) -> Result<Self> {
        let engine = DispatchEngine::new(cfg.grid()?, cfg.forecasts.interpolation);
        let forecasts = Arc::new(ForecastEngine::new(
            Arc::new(cfg.production_forecaster()?),
            Arc::new(cfg.consumption_forecaster()?),
            Arc::new(cfg.tariff_provider()?),
        ));
        let settings = ControllerSettings {
            thresholds: cfg.thresholds(),
            limits: cfg.soc_limits(),
            error_hold: TimeDelta::seconds(cfg.controller.error_hold_seconds.min(86_400) as i64),
            timezone: cfg.timezone()?,
        };
        Ok(Self::new(engine, forecasts, inverter, sink, settings))
    }

    pub async fn thresholds(&self) -> DispatchThresholds {
        *self.thresholds.read().await
    }

    /// Replaces the thresholds used from the next cycle on.
    pub async fn update_thresholds(&self, thresholds: DispatchThresholds) -> Result<(), DispatchError> {
        thresholds.validate()?;
        *self.thresholds.write().await = thresholds;
        info!("dispatch thresholds updated");
        Ok(())
    }

    pub async fn soc_limits(&self) -> SocLimits {
        *self.limits.read().await
    }

    /// Replaces the SOC limits used from the next cycle on.
    ///
    /// A grid-charge limit above the always-discharge limit is lowered; the
    /// limits actually stored are returned.
    pub async fn update_soc_limits(&self, limits: SocLimits) -> Result<SocLimits, DispatchError> {
        limits.validate()?;
        let (effective, lowered) = limits.normalized();
        if lowered {
            warn!(
                always_allow_discharge_limit = effective.always_allow_discharge_limit,
                requested = limits.max_charging_from_grid_limit,
                lowered = effective.max_charging_from_grid_limit,
                "max_charging_from_grid_limit above always_allow_discharge_limit, lowering it"
            );
        }
        *self.limits.write().await = effective;
        info!(
            always_allow_discharge_limit = effective.always_allow_discharge_limit,
            max_charging_from_grid_limit = effective.max_charging_from_grid_limit,
            "SOC limits updated"
        );
        Ok(effective)
    }

    /// Applies `decision` manually and leaves the inverter alone for the next
    /// evaluation.
    pub async fn override_decision(&self, decision: DispatchDecision) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;
        if let Some(power) = decision.target_power() {
            anyhow::ensure!(
                power.as_watts().is_finite() && power.as_watts() >= 0.0,
                "override charge power must be non-negative, got {power}"
            );
        }

        self.inverter
            .apply(&decision)
            .await
            .context("inverter rejected override")?;
        self.skip_next.store(true, Ordering::SeqCst);
        info!(decision = %decision, "manual override applied, skipping next evaluation");

        let now = Utc::now().with_timezone(&self.timezone).fixed_offset();
        let report = CycleReport {
            target_power: decision.target_power(),
            ..CycleReport::without_decision(now, Some(decision.mode()), CycleStatus::Overridden)
        };
        self.publish(&report).await;
        Ok(report)
    }

    /// Set while an external consumer (e.g. an EV charging session) must not
    /// be fed from the battery.
    pub fn set_discharge_blocked(&self, blocked: bool) {
        let previous = self.discharge_blocked.swap(blocked, Ordering::Relaxed);
        if previous != blocked {
            info!(blocked, "external discharge block changed");
        }
    }

    pub async fn evaluate(&self) -> Result<CycleReport> {
        let now = Utc::now().with_timezone(&self.timezone).fixed_offset();
        self.evaluate_at(now).await
    }

    /// Runs one fetch, decide and command cycle for `now`.
    ///
    /// Evaluation failures are absorbed by the error hold policy; only a
    /// failing inverter command is returned as an error.
    pub async fn evaluate_at(&self, now: DateTime<FixedOffset>) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;

        if self.skip_next.swap(false, Ordering::SeqCst) {
            let mode = self.inverter.current_mode().await;
            info!("manual override active, evaluation skipped");
            let report = CycleReport::without_decision(now, mode, CycleStatus::OverrideActive);
            self.publish(&report).await;
            return Ok(report);
        }

        let report = match self.decide_at(now).await {
            Ok(outcome) => {
                if let Some(since) = self.first_error_at.lock().await.take() {
                    info!(since = %since, "evaluation recovered");
                }
                self.inverter
                    .apply(&outcome.decision)
                    .await
                    .context("inverter rejected decision")?;
                info!(
                    decision = %outcome.decision,
                    reserve_window = outcome.telemetry.reserve_window,
                    required = %outcome.telemetry.required_reserve_energy,
                    available = %outcome.telemetry.available_energy,
                    "dispatch cycle"
                );
                CycleReport::decided(now, &outcome)
            }
            Err(e) => self.handle_failure(now, e).await?,
        };

        self.publish(&report).await;
        Ok(report)
    }

    async fn publish(&self, report: &CycleReport) {
        if let Err(e) = self.sink.publish(report).await {
            warn!(error = %e, "publishing cycle report failed");
        }
    }

    async fn decide_at(&self, now: DateTime<FixedOffset>) -> Result<DispatchOutcome> {
        let bundle = self.forecasts.fetch_all(now).await?;
        let state = self.inverter.read_state().await.context("reading battery state failed")?;
        let limits = *self.limits.read().await;
        let battery = BatterySnapshot::new(state, limits)
            .with_discharge_blocked(self.discharge_blocked.load(Ordering::Relaxed));

        let charging = self.inverter.current_mode().await == Some(InverterMode::ChargeFromGrid);
        let thresholds = self.thresholds.read().await.for_cycle(charging);

        let outcome = self.engine.decide(
            now,
            &bundle.production,
            &bundle.consumption,
            &bundle.prices,
            &battery,
            &thresholds,
        )?;
        Ok(outcome)
    }

    async fn handle_failure(&self, now: DateTime<FixedOffset>, err: anyhow::Error) -> Result<CycleReport> {
        let since = *self.first_error_at.lock().await.get_or_insert(now);
        let error = format!("{err:#}");

        if now - since < self.error_hold {
            let mode = self.inverter.current_mode().await;
            warn!(error = %error, since = %since, "evaluation failed, keeping last mode");
            return Ok(CycleReport::without_decision(now, mode, CycleStatus::HeldLastMode { error }));
        }

        error!(error = %error, since = %since, "evaluation failing past hold time, allowing discharge");
        let fallback = DispatchDecision::DischargeAllowed {
            pv_charge_limit: self.thresholds.read().await.max_pv_charge_rate,
        };
        self.inverter
            .apply(&fallback)
            .await
            .context("inverter rejected fallback decision")?;
        Ok(CycleReport::without_decision(
            now,
            Some(fallback.mode()),
            CycleStatus::FallbackDischarge { error },
        ))
    }

    /// Evaluates on every tick; a failing cycle is logged and the loop goes on.
    pub async fn run(&self, tick: std::time::Duration) {
        let mut interval = tokio::time::interval(tick.max(std::time::Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.evaluate().await {
                warn!(error = %format!("{e:#}"), "dispatch cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{IntervalGrid, InterpolationPolicy};
    use crate::domain::{BatteryState, Energy, ForecastKind, ForecastSeries, MockInverter, Power, SeriesAnchor};
    use crate::forecast::MockForecastProvider;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        reports: std::sync::Mutex<Vec<CycleReport>>,
    }

    #[async_trait::async_trait]
    impl DecisionSink for RecordingSink {
        async fn publish(&self, report: &CycleReport) -> Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    fn provider(kind: ForecastKind, values: Vec<f64>, fail_after: Option<Arc<AtomicUsize>>) -> MockForecastProvider {
        let mut p = MockForecastProvider::new();
        p.expect_native_resolution().return_const(60u32);
        p.expect_kind().return_const(kind);
        p.expect_anchor().return_const(SeriesAnchor::CurrentHour);
        p.expect_fetch().returning(move |_| {
            if let Some(remaining) = &fail_after {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
                {
                    anyhow::bail!("tariff API unreachable");
                }
            }
            Ok(ForecastSeries::new(kind, 60, SeriesAnchor::CurrentHour, values.clone()))
        });
        p
    }

    fn state(soc: f64) -> BatteryState {
        BatteryState {
            soc,
            capacity: Energy::watt_hours(10_000.0),
            reserved_floor: Energy::ZERO,
            power: Power::ZERO,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600).unwrap().with_ymd_and_hms(2025, 11, 3, h, m, 0).unwrap()
    }

    /// Expensive now and next hour, cheap in two hours; 2 kWh deficit per hour.
    fn controller(
        inverter: Arc<MockInverter>,
        sink: Arc<RecordingSink>,
        successful_price_fetches: Option<Arc<AtomicUsize>>,
    ) -> DispatchController {
        let forecasts = ForecastEngine::new(
            Arc::new(provider(ForecastKind::Energy, vec![0.0; 4], None)),
            Arc::new(provider(ForecastKind::Energy, vec![2000.0; 4], None)),
            Arc::new(provider(ForecastKind::Price, vec![0.20, 0.40, 0.10, 0.10], successful_price_fetches)),
        );
        DispatchController::new(
            DispatchEngine::new(IntervalGrid::new(60).unwrap(), InterpolationPolicy::Linear),
            Arc::new(forecasts),
            inverter,
            sink,
            ControllerSettings {
                thresholds: DispatchThresholds::default(),
                limits: SocLimits::default(),
                error_hold: TimeDelta::minutes(10),
                timezone: chrono_tz::Europe::Berlin,
            },
        )
    }

    #[tokio::test]
    async fn test_cycle_applies_decision_and_publishes() {
        let inverter = Arc::new(MockInverter::new(VecDeque::new(), state(0.1)));
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(inverter.clone(), sink.clone(), None);

        let report = ctl.evaluate_at(at(10, 0)).await.unwrap();
        // 4 kWh required over two hours, 1 kWh stored
        assert_eq!(report.status, CycleStatus::Decided);
        assert_eq!(report.mode, Some(InverterMode::ChargeFromGrid));
        let applied = inverter.applied().await;
        assert_eq!(applied.len(), 1);
        let power = applied[0].target_power().unwrap();
        assert!((power.as_watts() - 3300.0).abs() < 1e-6, "{power}");
        assert_eq!(sink.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_holds_then_falls_back() {
        let inverter = Arc::new(MockInverter::new(VecDeque::new(), state(0.1)));
        let sink = Arc::new(RecordingSink::default());
        let ok_fetches = Arc::new(AtomicUsize::new(1));
        let ctl = controller(inverter.clone(), sink.clone(), Some(ok_fetches));

        ctl.evaluate_at(at(10, 0)).await.unwrap();

        let held = ctl.evaluate_at(at(10, 3)).await.unwrap();
        assert!(matches!(held.status, CycleStatus::HeldLastMode { .. }));
        assert_eq!(held.mode, Some(InverterMode::ChargeFromGrid));
        assert_eq!(inverter.applied().await.len(), 1);

        let still_held = ctl.evaluate_at(at(10, 12)).await.unwrap();
        assert!(matches!(still_held.status, CycleStatus::HeldLastMode { .. }));

        let fallback = ctl.evaluate_at(at(10, 13)).await.unwrap();
        assert!(matches!(fallback.status, CycleStatus::FallbackDischarge { .. }));
        let applied = inverter.applied().await;
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].mode(), InverterMode::DischargeAllowed);
        assert_eq!(sink.reports.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_external_block_and_threshold_update() {
        let inverter = Arc::new(MockInverter::new(VecDeque::new(), state(0.85)));
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(inverter, sink, None);

        // 8.5 kWh stored covers the 4 kWh window: hold for the expensive hour
        let report = ctl.evaluate_at(at(10, 0)).await.unwrap();
        assert_eq!(report.mode, Some(InverterMode::AvoidDischarge));

        // a huge price gap means no cheaper hour ahead; 8 kWh over the horizon still fits
        ctl.update_thresholds(DispatchThresholds {
            min_price_difference: 1.0,
            ..DispatchThresholds::default()
        })
        .await
        .unwrap();
        let report = ctl.evaluate_at(at(10, 3)).await.unwrap();
        assert_eq!(report.mode, Some(InverterMode::DischargeAllowed));

        ctl.set_discharge_blocked(true);
        let report = ctl.evaluate_at(at(10, 6)).await.unwrap();
        assert_eq!(report.mode, Some(InverterMode::AvoidDischarge));

        let rejected = ctl
            .update_thresholds(DispatchThresholds {
                charge_rate_multiplier: 0.2,
                ..DispatchThresholds::default()
            })
            .await;
        assert!(rejected.is_err());
        assert_eq!(ctl.thresholds().await.min_price_difference, 1.0);
    }

    #[tokio::test]
    async fn test_soc_limit_update_applies_next_cycle() {
        let inverter = Arc::new(MockInverter::new(VecDeque::new(), state(0.85)));
        let ctl = controller(inverter, Arc::new(RecordingSink::default()), None);

        let report = ctl.evaluate_at(at(10, 0)).await.unwrap();
        assert_eq!(report.mode, Some(InverterMode::AvoidDischarge));

        let lowered = SocLimits {
            always_allow_discharge_limit: 0.8,
            max_charging_from_grid_limit: 0.7,
        };
        assert_eq!(ctl.update_soc_limits(lowered).await.unwrap(), lowered);
        let report = ctl.evaluate_at(at(10, 3)).await.unwrap();
        assert_eq!(report.mode, Some(InverterMode::DischargeAllowed));

        let crossed = SocLimits {
            always_allow_discharge_limit: 0.9,
            max_charging_from_grid_limit: 0.95,
        };
        let effective = ctl.update_soc_limits(crossed).await.unwrap();
        assert!((effective.max_charging_from_grid_limit - 0.89).abs() < 1e-12);
        assert_eq!(ctl.soc_limits().await, effective);

        let invalid = SocLimits {
            always_allow_discharge_limit: 1.5,
            max_charging_from_grid_limit: 0.8,
        };
        assert!(matches!(
            ctl.update_soc_limits(invalid).await,
            Err(DispatchError::InvalidThreshold { name: "always_allow_discharge_limit", .. })
        ));
        assert_eq!(ctl.soc_limits().await, effective);
    }

    #[tokio::test]
    async fn test_override_skips_exactly_one_evaluation() {
        let inverter = Arc::new(MockInverter::new(VecDeque::new(), state(0.85)));
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(inverter.clone(), sink.clone(), None);

        let forced = DispatchDecision::ChargeFromGrid {
            target_power: Power::watts(1000.0),
            energy_to_buy: Energy::ZERO,
            reserve_window: 0,
        };
        let report = ctl.override_decision(forced).await.unwrap();
        assert_eq!(report.status, CycleStatus::Overridden);
        assert_eq!(report.target_power, Some(Power::watts(1000.0)));

        let skipped = ctl.evaluate_at(at(10, 0)).await.unwrap();
        assert_eq!(skipped.status, CycleStatus::OverrideActive);
        assert_eq!(skipped.mode, Some(InverterMode::ChargeFromGrid));
        assert_eq!(inverter.applied().await, vec![forced]);

        let resumed = ctl.evaluate_at(at(10, 3)).await.unwrap();
        assert_eq!(resumed.status, CycleStatus::Decided);
        assert_eq!(resumed.mode, Some(InverterMode::AvoidDischarge));
        assert_eq!(inverter.applied().await.len(), 2);
        assert_eq!(sink.reports.lock().unwrap().len(), 3);

        let negative = DispatchDecision::ChargeFromGrid {
            target_power: Power::watts(-10.0),
            energy_to_buy: Energy::ZERO,
            reserve_window: 0,
        };
        assert!(ctl.override_decision(negative).await.is_err());
        assert_eq!(inverter.applied().await.len(), 2);
    }
}
