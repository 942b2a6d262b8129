use serde::Serialize;
use tracing::debug;

use super::thresholds::DispatchThresholds;
use crate::domain::types::round_to;
use crate::domain::{Energy, Price};

/// `consumption - production` per interval; positive values are deficits.
///
/// Both slices come out of the aligner with equal length.
pub fn net_consumption(production: &[Energy], consumption: &[Energy]) -> Vec<Energy> {
    debug_assert_eq!(production.len(), consumption.len());
    consumption
        .iter()
        .zip(production)
        .map(|(&c, &p)| c - p)
        .collect()
}

/// Price gap a future interval must undercut the current price by.
pub fn price_threshold(current_price: Price, thresholds: &DispatchThresholds) -> f64 {
    let gap = thresholds
        .min_price_difference
        .max(current_price.as_per_kwh().abs() * thresholds.min_price_difference_rel);
    let gap = round_to(gap, thresholds.round_price_digits);
    match thresholds.soften_factor {
        Some(factor) => gap / factor,
        None => gap,
    }
}

/// Index of the first interval priced at or below `boundary`, scanning from 1.
///
/// Returns `None` when no interval within `max_horizon` qualifies.
pub fn first_cheaper_interval(prices: &[Price], boundary: Price, max_horizon: usize) -> Option<usize> {
    let horizon = prices.len().min(max_horizon);
    (1..horizon).find(|&i| prices[i] <= boundary)
}

/// Sum of deficits over `[0, window)`; surplus intervals count as zero.
pub fn required_reserve_energy(net: &[Energy], window: usize) -> Energy {
    net.iter()
        .take(window)
        .filter(|e| e.as_watt_hours() > 0.0)
        .copied()
        .sum()
}

/// Result of the look-ahead scan over one aligned forecast.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ReserveAnalysis {
    pub current_price: Price,
    pub threshold: f64,
    pub price_boundary: Price,
    /// Intervals to cover before the next materially cheaper one.
    pub reserve_window: usize,
    /// True when the window ended at a cheaper interval rather than the horizon.
    pub cheaper_price_ahead: bool,
    /// True when some interval in `[1, W)` is priced above the current one.
    pub price_rise_ahead: bool,
    pub required_energy: Energy,
}

/// Runs the look-ahead scan. `prices` and `net` must be non-empty and equal in length.
pub fn analyze(prices: &[Price], net: &[Energy], thresholds: &DispatchThresholds) -> ReserveAnalysis {
    let digits = thresholds.round_price_digits;
    let prices: Vec<Price> = prices.iter().map(|p| p.rounded(digits)).collect();
    let current_price = prices.first().copied().unwrap_or_default();

    let threshold = price_threshold(current_price, thresholds);
    let price_boundary = Price::per_kwh(current_price.as_per_kwh() - threshold).rounded(digits);

    let horizon = prices.len().min(thresholds.max_horizon_intervals);
    let cheaper = first_cheaper_interval(&prices, price_boundary, thresholds.max_horizon_intervals);
    let reserve_window = cheaper.unwrap_or(horizon);

    let price_rise_ahead = prices
        .iter()
        .take(reserve_window)
        .skip(1)
        .any(|p| *p > current_price);
    let required_energy = required_reserve_energy(net, reserve_window);

    debug!(
        current_price = %current_price,
        threshold,
        boundary = %price_boundary,
        reserve_window,
        horizon,
        required = %required_energy,
        "look-ahead scan"
    );

    ReserveAnalysis {
        current_price,
        threshold,
        price_boundary,
        reserve_window,
        cheaper_price_ahead: cheaper.is_some(),
        price_rise_ahead,
        required_energy,
    }
}
