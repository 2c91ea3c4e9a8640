//! Min/max linear normalization into a fixed integer range.

/// Observed extent of a value distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

/// Scans all present, finite values and returns their extent.
///
/// Returns `{0, 0}` when there is nothing to scan.
#[must_use]
pub fn min_max(values: impl IntoIterator<Item = Option<f64>>) -> MinMax {
    values
        .into_iter()
        .flatten()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<MinMax>, v| {
            Some(acc.map_or(MinMax { min: v, max: v }, |r| MinMax {
                min: r.min.min(v),
                max: r.max.max(v),
            }))
        })
        .unwrap_or(MinMax { min: 0.0, max: 0.0 })
}

/// Maps `value` linearly from `range` onto `0..=out_scale`.
///
/// A degenerate range (`max == min`) maps everything to `out_scale` when the
/// single observed value is positive and to `0` otherwise. Missing or
/// non-finite values map to `0`. The result is rounded half away from zero
/// and clamped into the output range.
#[must_use]
#[allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn normalize(value: Option<f64>, range: MinMax, out_scale: u32) -> u32 {
    if range.max == range.min {
        return if range.min > 0.0 { out_scale } else { 0 };
    }

    let Some(value) = value.filter(|v| v.is_finite()) else {
        return 0;
    };

    let scaled = ((value - range.min) / (range.max - range.min)) * f64::from(out_scale);

    scaled.round().clamp(0.0, f64::from(out_scale)) as u32
}
