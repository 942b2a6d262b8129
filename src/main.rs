use anyhow::Result;
use battery_dispatch::{config, controller, domain, telemetry};
use config::Config;
use controller::DispatchController;
use domain::{Power, SimulatedInverter};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{init_tracing, TracingSink};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;

    let step_hours = cfg.controller.tick_seconds as f64 / 3600.0;
    let inverter = Arc::new(SimulatedInverter::new(
        cfg.initial_battery_state(),
        Power::watts(cfg.battery_control.max_grid_charge_rate),
        step_hours,
    )
    .with_house_load(Power::watts(cfg.forecasts.consumption.base_w)));
    let dispatch = DispatchController::from_config(&cfg, inverter, Arc::new(TracingSink))?;

    info!(
        interval_minutes = cfg.controller.interval_minutes,
        tick_seconds = cfg.controller.tick_seconds,
        timezone = %cfg.controller.timezone,
        "starting battery dispatch"
    );

    tokio::select! {
        _ = dispatch.run(Duration::from_secs(cfg.controller.tick_seconds)) => {},
        _ = telemetry::shutdown_signal() => {},
    }

    warn!("shutdown complete");
    Ok(())
}
