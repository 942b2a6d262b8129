use anyhow::{ensure, Context, Result};
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use tracing::debug;

use super::ForecastProvider;
use crate::domain::ForecastSeries;

/// The three raw inputs of one evaluation, fetched for the same "now".
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastBundle {
    pub fetched_at: DateTime<FixedOffset>,
    pub production: ForecastSeries,
    pub consumption: ForecastSeries,
    pub prices: ForecastSeries,
}

pub struct ForecastEngine {
    pub production: Arc<dyn ForecastProvider>,
    pub consumption: Arc<dyn ForecastProvider>,
    pub prices: Arc<dyn ForecastProvider>,
}

impl ForecastEngine {
    pub fn new(
        production: Arc<dyn ForecastProvider>,
        consumption: Arc<dyn ForecastProvider>,
        prices: Arc<dyn ForecastProvider>,
    ) -> Self {
        Self {
            production,
            consumption,
            prices,
        }
    }

    /// Fetches all three forecasts concurrently; the first failure wins.
    pub async fn fetch_all(&self, now: DateTime<FixedOffset>) -> Result<ForecastBundle> {
        let (production, consumption, prices) = tokio::try_join!(
            fetch_checked("production", self.production.as_ref(), now),
            fetch_checked("consumption", self.consumption.as_ref(), now),
            fetch_checked("prices", self.prices.as_ref(), now),
        )?;

        debug!(
            production = production.len(),
            consumption = consumption.len(),
            prices = prices.len(),
            "forecasts fetched"
        );

        Ok(ForecastBundle {
            fetched_at: now,
            production,
            consumption,
            prices,
        })
    }
}

/// Fetches and checks the series against what the provider declares.
async fn fetch_checked(
    role: &'static str,
    provider: &dyn ForecastProvider,
    now: DateTime<FixedOffset>,
) -> Result<ForecastSeries> {
    let series = provider
        .fetch(now)
        .await
        .with_context(|| format!("{role} forecast fetch failed"))?;
    ensure!(
        series.resolution_minutes == provider.native_resolution(),
        "{role} provider declared {} min resolution but delivered {} min",
        provider.native_resolution(),
        series.resolution_minutes
    );
    ensure!(
        series.kind == provider.kind(),
        "{role} provider declared kind {} but delivered {}",
        provider.kind(),
        series.kind
    );
    Ok(ForecastSeries {
        anchor: provider.anchor(),
        ..series
    })
}
