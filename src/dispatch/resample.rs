use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::{Degradation, ForecastKind, ForecastSeries};
use crate::error::{DispatchError, Result};

/// Sums below this are treated as "no shape" when renormalizing.
const SHAPE_EPSILON: f64 = 1e-9;

/// How an energy series is spread over finer sub-intervals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InterpolationPolicy {
    /// Every sub-interval gets an equal share.
    Constant,
    /// Average power ramps linearly from one native interval to the next.
    #[default]
    Linear,
    /// Catmull-Rom curve through the average powers, floored at zero.
    Smooth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ratio {
    Same,
    Up(usize),
    Down(usize),
}

fn ratio(native: u32, target: u32) -> Result<Ratio> {
    let unsupported = DispatchError::UnsupportedResolutionRatio { native, target };
    if native == 0 || target == 0 {
        return Err(unsupported);
    }
    if native == target {
        Ok(Ratio::Same)
    } else if native % target == 0 {
        Ok(Ratio::Up((native / target) as usize))
    } else if target % native == 0 {
        Ok(Ratio::Down((target / native) as usize))
    } else {
        Err(unsupported)
    }
}

/// Converts `series` to `target_minutes` resolution.
///
/// Energies are redistributed on upsampling and summed on downsampling;
/// prices and powers are replicated on upsampling and averaged on
/// downsampling. An incomplete trailing group is dropped when downsampling.
///
/// Linear and smooth interpolation need two or more points. Shorter energy
/// series fall back to constant and report an
/// [`Degradation::InterpolationFallback`].
pub fn convert(
    series: &ForecastSeries,
    target_minutes: u32,
    policy: InterpolationPolicy,
    role: &'static str,
) -> Result<(ForecastSeries, Option<Degradation>)> {
    let mut degradation = None;

    let values = match ratio(series.resolution_minutes, target_minutes)? {
        Ratio::Same => series.values.clone(),
        Ratio::Up(k) if series.kind.is_additive() => {
            let effective = if policy != InterpolationPolicy::Constant && series.len() < 2 {
                degradation = Some(Degradation::InterpolationFallback {
                    role,
                    requested: policy.to_string(),
                    len: series.len(),
                });
                InterpolationPolicy::Constant
            } else {
                policy
            };
            upsample_energy(&series.values, k, effective)
        }
        Ratio::Up(k) => series
            .values
            .iter()
            .flat_map(|&v| itertools::repeat_n(v, k))
            .collect(),
        Ratio::Down(k) => downsample(&series.values, k, series.kind),
    };

    let converted = ForecastSeries::new(series.kind, target_minutes, series.anchor, values);
    Ok((converted, degradation))
}

fn upsample_energy(values: &[f64], k: usize, policy: InterpolationPolicy) -> Vec<f64> {
    match policy {
        InterpolationPolicy::Constant => values
            .iter()
            .flat_map(|&v| itertools::repeat_n(v / k as f64, k))
            .collect(),
        InterpolationPolicy::Linear => {
            // The last native interval has no successor and stays flat.
            values
                .iter()
                .copied()
                .chain(values.last().copied())
                .tuple_windows()
                .flat_map(|(current, next)| {
                    let shape = (0..k)
                        .map(|j| current + (next - current) * j as f64 / k as f64)
                        .collect_vec();
                    renormalize(shape, current)
                })
                .collect()
        }
        InterpolationPolicy::Smooth => (0..values.len())
            .flat_map(|i| {
                let shape = (0..k)
                    .map(|j| catmull_rom(values, i, j as f64 / k as f64).max(0.0))
                    .collect_vec();
                renormalize(shape, values[i])
            })
            .collect(),
    }
}

/// Scales the interpolated sub-interval values so that they add up to the
/// energy of their native interval.
///
/// The per-interval energy is an average power times a fixed duration, so
/// interpolating energies and interpolating powers yield the same shape.
fn renormalize(shape: Vec<f64>, total: f64) -> Vec<f64> {
    let k = shape.len();
    let sum: f64 = shape.iter().sum();
    if sum.abs() < SHAPE_EPSILON {
        return vec![total / k as f64; k];
    }
    shape.into_iter().map(|v| v * total / sum).collect()
}

/// Catmull-Rom segment between knots `i` and `i + 1`, evaluated at `t` in `[0, 1)`.
fn catmull_rom(values: &[f64], i: usize, t: f64) -> f64 {
    let last = values.len() - 1;
    let at = |idx: isize| values[idx.clamp(0, last as isize) as usize];
    let i = i as isize;
    let (p0, p1, p2, p3) = (at(i - 1), at(i), at(i + 1), at(i + 2));

    0.5 * (2.0 * p1
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t * t
        + (3.0 * p1 - p0 - 3.0 * p2 + p3) * t * t * t)
}

fn downsample(values: &[f64], k: usize, kind: ForecastKind) -> Vec<f64> {
    values
        .chunks_exact(k)
        .map(|chunk| {
            let sum: f64 = chunk.iter().sum();
            if kind.is_additive() {
                sum
            } else {
                sum / k as f64
            }
        })
        .collect()
}
