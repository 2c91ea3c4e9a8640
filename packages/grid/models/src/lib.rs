#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Grid cell, time window, and configuration types for alert map
//! aggregation.
//!
//! Grid cells are addressed by integer "scaled" coordinates: at precision
//! level `L` a cell spans `10^-L` degrees and its address along each axis is
//! `trunc(coord * 10^L)`. A level-`L` cell's parent at level `L - 1` is found
//! by dividing both scaled coordinates by 10 with truncation toward zero,
//! which is exactly Rust's integer division.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Coarsest supported precision level (1 degree cells).
pub const MIN_LEVEL: u8 = 0;

/// Finest precision level used by the default configuration
/// (`0.00001` degree cells, roughly one metre).
pub const MAX_LEVEL: u8 = 5;

/// Upper bound accepted for a configured maximum level. Above this the
/// scaled coordinates of a 180 degree longitude no longer fit comfortably in
/// an `i64` after multiplication.
pub const LEVEL_LIMIT: u8 = 9;

/// Output range of the density normalization.
pub const DENSITY_SCALE: u32 = 255;

/// Milliseconds in one day.
pub const DAY_MS: i64 = 86_400_000;

/// Integer address of a grid cell at some precision level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    /// Scaled longitude.
    pub lon: i64,
    /// Scaled latitude.
    pub lat: i64,
}

impl CellKey {
    #[must_use]
    pub const fn new(lon: i64, lat: i64) -> Self {
        Self { lon, lat }
    }

    /// Returns the cell one precision level coarser that contains this one.
    #[must_use]
    pub const fn parent(self) -> Self {
        Self {
            lon: self.lon / 10,
            lat: self.lat / 10,
        }
    }

    /// Returns the cell displaced by `(d_lon, d_lat)` cells at the same level.
    #[must_use]
    pub const fn offset(self, d_lon: i64, d_lat: i64) -> Self {
        Self {
            lon: self.lon + d_lon,
            lat: self.lat + d_lat,
        }
    }

    /// Chebyshev distance (in cells) between two cells of the same level.
    #[must_use]
    pub const fn chebyshev_distance(self, other: Self) -> u64 {
        let d_lon = self.lon.abs_diff(other.lon);
        let d_lat = self.lat.abs_diff(other.lat);
        if d_lon > d_lat { d_lon } else { d_lat }
    }
}

/// Half-open millisecond interval `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    #[must_use]
    pub const fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms
    }
}

/// A relative recency bucket such as "between 7 and 30 days ago".
///
/// Id 0 is the most recent window; increasing ids reach further into the
/// past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub id: u32,
    /// Newer edge of the window, in days before the reference timestamp.
    pub days_ago_start: u32,
    /// Older edge of the window, in days before the reference timestamp.
    pub days_ago_end: u32,
}

impl TimeWindow {
    /// Inclusive lower bound of this window relative to `reference_ms`.
    #[must_use]
    pub fn lower_bound_ms(&self, reference_ms: i64) -> i64 {
        reference_ms - i64::from(self.days_ago_end) * DAY_MS
    }

    /// Absolute bounds of this window relative to `reference_ms`.
    #[must_use]
    pub fn range(&self, reference_ms: i64) -> TimeRange {
        TimeRange {
            start_ms: self.lower_bound_ms(reference_ms),
            end_ms: reference_ms - i64::from(self.days_ago_start) * DAY_MS,
        }
    }
}

/// One configured neighborhood radius for diversity scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusGroup {
    /// Position of the radius in the configured list.
    pub id: u32,
    /// Radius in degrees.
    pub radius: f64,
}

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl BoundingBox {
    /// Midpoint of the box as `(longitude, latitude)`.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            f64::midpoint(self.left, self.right),
            f64::midpoint(self.top, self.bottom),
        )
    }
}

/// Static configuration for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Recency buckets, ordered by id.
    pub time_windows: Vec<TimeWindow>,
    /// Neighborhood radii in degrees; the group id is the list index.
    pub radius_groups: Vec<f64>,
    #[serde(default = "default_min_level")]
    pub min_level: u8,
    #[serde(default = "default_max_level")]
    pub max_level: u8,
    /// Ingestion bounding box, used for the map center.
    pub area: BoundingBox,
}

const fn default_min_level() -> u8 {
    MIN_LEVEL
}

const fn default_max_level() -> u8 {
    MAX_LEVEL
}

impl GridConfig {
    /// Radius groups with their ids assigned from list position.
    #[must_use]
    pub fn radius_groups(&self) -> Vec<RadiusGroup> {
        self.radius_groups
            .iter()
            .zip(0u32..)
            .map(|(&radius, id)| RadiusGroup { id, radius })
            .collect()
    }

    /// Precision levels from finest to coarsest.
    pub fn levels_descending(&self) -> impl Iterator<Item = u8> + use<> {
        (self.min_level..=self.max_level).rev()
    }

    /// The union of all configured windows, from the oldest edge to the
    /// newest edge. Returns `None` when no windows are configured.
    #[must_use]
    pub fn horizon(&self, reference_ms: i64) -> Option<TimeRange> {
        let oldest = self.time_windows.iter().map(|w| w.days_ago_end).max()?;
        let newest = self.time_windows.iter().map(|w| w.days_ago_start).min()?;
        Some(TimeRange {
            start_ms: reference_ms - i64::from(oldest) * DAY_MS,
            end_ms: reference_ms - i64::from(newest) * DAY_MS,
        })
    }
}

/// A persisted density grid row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensityCell {
    pub time_window_id: u32,
    pub level: u8,
    pub cell: CellKey,
    /// Log-normalized intensity in `1..=255` (zero is never stored).
    pub density: u8,
}

/// A persisted temporal diversity grid row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiversityCell {
    pub radius_group_id: u32,
    pub level: u8,
    pub cell: CellKey,
    /// Number of distinct time windows seen near the cell.
    pub score: u32,
}

/// Keys of the generated metadata table.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetadataKey {
    /// Reference timestamp of the last run, epoch milliseconds.
    LastUpdate,
    /// Longitude of the configured area's center.
    CenterLon,
    /// Latitude of the configured area's center.
    CenterLat,
    /// Number of mappable alerts inside the configured time horizon.
    TotalAlerts,
}

impl MetadataKey {
    pub const ALL: &[Self] = &[
        Self::LastUpdate,
        Self::CenterLon,
        Self::CenterLat,
        Self::TotalAlerts,
    ];
}

/// Errors surfaced by event sources and grid sinks.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage engine failed.
    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A stored row could not be mapped back to a grid type.
    #[error("Invalid stored row: {message}")]
    InvalidRow {
        /// Description of what went wrong.
        message: String,
    },
}
