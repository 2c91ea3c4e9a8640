//! Coordinate scaling: the addressing scheme for every grid cell.

use alert_map_grid_models::CellKey;

/// Converts a degree coordinate into its integer cell address at `level`.
///
/// Returns `None` for missing, non-finite, or zero coordinates. Otherwise
/// the result is `trunc(coord * 10^level)`; truncation (not flooring) means
/// `-0.5` and `0.5` both land in cell `0` at level 0.
#[must_use]
pub fn scale(coord: Option<f64>, level: u8) -> Option<i64> {
    let coord = coord?;
    if !coord.is_finite() || coord == 0.0 {
        return None;
    }

    #[allow(clippy::cast_possible_truncation)]
    let scaled = (coord * 10f64.powi(i32::from(level))).trunc() as i64;
    Some(scaled)
}

/// Cell containing `(lon, lat)` at `level`, or `None` if either axis fails
/// to scale.
#[must_use]
pub fn cell_key(lon: f64, lat: f64, level: u8) -> Option<CellKey> {
    Some(CellKey::new(
        scale(Some(lon), level)?,
        scale(Some(lat), level)?,
    ))
}

/// Edge length of a cell at `level`, in degrees.
#[must_use]
pub fn cell_resolution(level: u8) -> f64 {
    10f64.powi(-i32::from(level))
}
