use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{local_interval_start, ForecastProvider};
use crate::domain::{ForecastKind, ForecastSeries, SeriesAnchor};

/// Repeating two-zone time-of-use tariff.
///
/// Zone 1 runs from `zone_1_start` (inclusive) to `zone_1_end` (exclusive)
/// local hour; a start after the end wraps around midnight.
#[derive(Debug, Clone)]
pub struct TariffZonesPriceProvider {
    pub zone_1_price: f64,
    pub zone_2_price: f64,
    pub zone_1_start: u32,
    pub zone_1_end: u32,
    pub horizon_hours: usize,
    pub timezone: Tz,
}

impl TariffZonesPriceProvider {
    pub fn new(
        zone_1_price: f64,
        zone_2_price: f64,
        zone_1_start: u32,
        zone_1_end: u32,
        timezone: Tz,
    ) -> Result<Self> {
        ensure!(zone_1_start < 24, "zone_1_start must be an hour in 0..24, got {zone_1_start}");
        ensure!(zone_1_end < 24, "zone_1_end must be an hour in 0..24, got {zone_1_end}");
        Ok(Self {
            zone_1_price,
            zone_2_price,
            zone_1_start,
            zone_1_end,
            horizon_hours: 48,
            timezone,
        })
    }

    pub fn is_zone_1(&self, hour: u32) -> bool {
        if self.zone_1_start <= self.zone_1_end {
            hour >= self.zone_1_start && hour < self.zone_1_end
        } else {
            !(hour >= self.zone_1_end && hour < self.zone_1_start)
        }
    }

    pub fn price_at_hour(&self, hour: u32) -> f64 {
        if self.is_zone_1(hour) {
            self.zone_1_price
        } else {
            self.zone_2_price
        }
    }
}

#[async_trait]
impl ForecastProvider for TariffZonesPriceProvider {
    fn native_resolution(&self) -> u32 {
        60
    }

    fn kind(&self) -> ForecastKind {
        ForecastKind::Price
    }

    fn anchor(&self) -> SeriesAnchor {
        SeriesAnchor::CurrentHour
    }

    async fn fetch(&self, now: DateTime<FixedOffset>) -> Result<ForecastSeries> {
        let start = local_interval_start(now, self.timezone, 60)?;
        let values = (0..self.horizon_hours)
            .map(|h| {
                let ts = start + TimeDelta::hours(h as i64);
                self.price_at_hour(ts.hour())
            })
            .collect::<Vec<_>>();
        debug!(count = values.len(), "tariff zones generated hourly prices");
        Ok(ForecastSeries::price(60, values))
    }
}

/// Hourly day-ahead market prices pushed in by an external fetcher.
///
/// Raw prices are per MWh; the series carries the end-customer price per kWh
/// `(raw / 1000 * (1 + markup) + fees) * (1 + vat)`. Every hour from the
/// current one up to the last published hour must be present, otherwise the
/// fetch fails with [`crate::error::DispatchError::SparseForecast`].
#[derive(Debug, Default)]
pub struct MarketPriceProvider {
    pub markup: f64,
    pub fees: f64,
    pub vat: f64,
    prices: RwLock<BTreeMap<DateTime<Utc>, f64>>,
}

impl MarketPriceProvider {
    pub fn new(markup: f64, fees: f64, vat: f64) -> Self {
        Self {
            markup,
            fees,
            vat,
            prices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replaces the published prices; keys are the starts of their hours.
    pub async fn publish(&self, raw: impl IntoIterator<Item = (DateTime<Utc>, f64)>) {
        let raw: BTreeMap<_, _> = raw.into_iter().collect();
        debug!(count = raw.len(), "market prices published");
        *self.prices.write().await = raw;
    }

    pub fn end_price(&self, raw_per_mwh: f64) -> f64 {
        (raw_per_mwh / 1000.0 * (1.0 + self.markup) + self.fees) * (1.0 + self.vat)
    }
}

#[async_trait]
impl ForecastProvider for MarketPriceProvider {
    fn native_resolution(&self) -> u32 {
        60
    }

    fn kind(&self) -> ForecastKind {
        ForecastKind::Price
    }

    fn anchor(&self) -> SeriesAnchor {
        SeriesAnchor::CurrentHour
    }

    async fn fetch(&self, now: DateTime<FixedOffset>) -> Result<ForecastSeries> {
        let start = local_interval_start(now, chrono_tz::UTC, 60)?.with_timezone(&Utc);
        let prices = self.prices.read().await;

        let indexed: BTreeMap<usize, f64> = prices
            .range(start..)
            .filter_map(|(ts, &raw)| {
                let offset = *ts - start;
                (offset.num_seconds() % 3600 == 0)
                    .then(|| (offset.num_hours() as usize, self.end_price(raw)))
            })
            .collect();
        ensure!(!indexed.is_empty(), "no market prices published from {start} on");

        let series = ForecastSeries::from_indexed("prices", ForecastKind::Price, 60, SeriesAnchor::CurrentHour, &indexed)?;
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(7, 22, 6, false)]
    #[case(7, 22, 7, true)]
    #[case(7, 22, 21, true)]
    #[case(7, 22, 22, false)]
    #[case(20, 6, 23, true)]
    #[case(20, 6, 3, true)]
    #[case(20, 6, 6, false)]
    #[case(20, 6, 12, false)]
    fn test_zone_membership(#[case] start: u32, #[case] end: u32, #[case] hour: u32, #[case] zone_1: bool) {
        let tariff = TariffZonesPriceProvider::new(0.30, 0.20, start, end, chrono_tz::UTC).unwrap();
        assert_eq!(tariff.is_zone_1(hour), zone_1);
    }

    #[test]
    fn test_rejects_invalid_hours() {
        assert!(TariffZonesPriceProvider::new(0.3, 0.2, 24, 6, chrono_tz::UTC).is_err());
        assert!(TariffZonesPriceProvider::new(0.3, 0.2, 7, 30, chrono_tz::UTC).is_err());
    }

    #[tokio::test]
    async fn test_fetch_is_hour_aligned_in_local_time() {
        let tariff = TariffZonesPriceProvider::new(0.30, 0.20, 7, 22, chrono_tz::Europe::Berlin).unwrap();
        // 20:40 UTC is 21:40 CET
        let now = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 1, 15, 20, 40, 0)
            .unwrap();
        let series = tariff.fetch(now).await.unwrap();
        assert_eq!(series.kind, ForecastKind::Price);
        assert_eq!(series.resolution_minutes, 60);
        assert_eq!(series.len(), 48);
        assert_eq!(&series.values[..3], &[0.30, 0.20, 0.20]);
        // 07:00 local the next morning is index 10
        assert_eq!(series.values[9], 0.20);
        assert_eq!(series.values[10], 0.30);
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, h, 0, 0).unwrap()
    }

    fn utc_now(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 4, h + 1, m, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_market_prices_start_at_current_hour() {
        let market = MarketPriceProvider::new(0.1, 0.02, 0.2);
        market
            .publish([(hour(8), 100.0), (hour(9), 200.0), (hour(10), 50.0), (hour(11), 80.0)])
            .await;

        let series = market.fetch(utc_now(9, 20)).await.unwrap();
        assert_eq!(series.len(), 3);
        // (200 / 1000 * 1.1 + 0.02) * 1.2
        assert!((series.values[0] - 0.288).abs() < 1e-12);
        assert!((series.values[1] - market.end_price(50.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_market_price_gap_is_rejected() {
        let market = MarketPriceProvider::new(0.0, 0.0, 0.0);
        market.publish([(hour(9), 100.0), (hour(10), 90.0), (hour(12), 80.0)]).await;

        let err = market.fetch(utc_now(9, 0)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<DispatchError>(),
            Some(&DispatchError::SparseForecast {
                role: "prices",
                missing_index: 2
            })
        );

        // the current hour itself missing
        let err = market.fetch(utc_now(11, 0)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::SparseForecast { missing_index: 0, .. })
        ));

        assert!(market.fetch(utc_now(13, 0)).await.is_err());
    }
}
