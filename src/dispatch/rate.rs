use super::thresholds::DispatchThresholds;
use crate::domain::{Energy, Power};

/// Shortest remaining time divided by; bounds the rate near an interval end.
pub const MIN_REMAINING_TIME_HOURS: f64 = 1.0 / 60.0;

/// Power needed to buy `energy_to_buy` before the running interval ends.
///
/// A non-positive `remaining_time_hours` means the interval has just ended
/// and the next one is used in full. Positive targets are raised to
/// `min_charge_rate`, then everything is capped at `max_grid_charge_rate`.
pub fn target_power(
    energy_to_buy: Energy,
    remaining_time_hours: f64,
    interval_hours: f64,
    thresholds: &DispatchThresholds,
) -> Power {
    if energy_to_buy.as_watt_hours() <= 0.0 {
        return Power::ZERO;
    }

    let hours = if remaining_time_hours > 0.0 {
        remaining_time_hours.max(MIN_REMAINING_TIME_HOURS)
    } else {
        interval_hours
    };

    let raw = Energy(energy_to_buy.as_watt_hours() * thresholds.charge_rate_multiplier).per_hours(hours);
    raw.max(thresholds.min_charge_rate)
        .clamp(Power::ZERO, thresholds.max_grid_charge_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(300.0, 0.25, 5000.0, 1320.0)]
    #[case(300.0, 0.25, 1000.0, 1000.0)]
    #[case(50.0, 1.0, 5000.0, 500.0)]
    #[case(0.0, 0.25, 5000.0, 0.0)]
    #[case(1000.0, 0.0001, 99_999.0, 66_000.0)]
    fn test_target_power(
        #[case] energy: f64,
        #[case] remaining: f64,
        #[case] max_rate: f64,
        #[case] expected: f64,
    ) {
        let thresholds = DispatchThresholds {
            max_grid_charge_rate: Power::watts(max_rate),
            ..Default::default()
        };
        let power = target_power(Energy(energy), remaining, 0.25, &thresholds);
        assert!((power.as_watts() - expected).abs() < 1e-6, "{power}");
    }

    #[test]
    fn test_zero_remaining_uses_next_interval() {
        let power = target_power(Energy(300.0), 0.0, 0.25, &DispatchThresholds::default());
        assert!((power.as_watts() - 1320.0).abs() < 1e-6);
    }

    #[test]
    fn test_min_charge_rate_still_capped() {
        let thresholds = DispatchThresholds {
            max_grid_charge_rate: Power::watts(300.0),
            ..Default::default()
        };
        assert_eq!(target_power(Energy(10.0), 1.0, 1.0, &thresholds), Power::watts(300.0));
    }
}
