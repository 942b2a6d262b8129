use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::domain::{DecisionTelemetry, Degradation, DispatchOutcome, InverterMode, Power};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,battery_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

/// How a controller cycle ended.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleStatus {
    /// A fresh decision was applied.
    Decided,
    /// Evaluation failed; the previous mode stays in place.
    HeldLastMode { error: String },
    /// Evaluation kept failing past the hold time; discharge was re-enabled.
    FallbackDischarge { error: String },
    /// A manual decision was applied from outside the loop.
    Overridden,
    /// Evaluation skipped once after a manual override.
    OverrideActive,
}

/// One published record per controller cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CycleReport {
    pub timestamp: DateTime<FixedOffset>,
    pub mode: Option<InverterMode>,
    pub target_power: Option<Power>,
    #[serde(flatten)]
    pub status: CycleStatus,
    pub telemetry: Option<DecisionTelemetry>,
    pub degradations: Vec<Degradation>,
}

impl CycleReport {
    pub fn decided(timestamp: DateTime<FixedOffset>, outcome: &DispatchOutcome) -> Self {
        Self {
            timestamp,
            mode: Some(outcome.decision.mode()),
            target_power: outcome.decision.target_power(),
            status: CycleStatus::Decided,
            telemetry: Some(outcome.telemetry),
            degradations: outcome.degradations.clone(),
        }
    }

    /// Report for a cycle that did not run the engine.
    pub fn without_decision(timestamp: DateTime<FixedOffset>, mode: Option<InverterMode>, status: CycleStatus) -> Self {
        Self {
            timestamp,
            mode,
            target_power: None,
            status,
            telemetry: None,
            degradations: Vec::new(),
        }
    }
}

/// Outbound observability channel (MQTT, metrics, ...).
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn publish(&self, report: &CycleReport) -> Result<()>;
}

/// Emits each report as one JSON document on the `dispatch::telemetry` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl DecisionSink for TracingSink {
    async fn publish(&self, report: &CycleReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        info!(target: "dispatch::telemetry", report = %json, "cycle report");
        Ok(())
    }
}
