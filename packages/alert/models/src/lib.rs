#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Police alert event types.
//!
//! An [`AlertEvent`] is one deduplicated report as stored by the ingestion
//! side of the toolchain. The grid generator only ever reads these; events
//! without coordinates are kept in storage but never aggregated.

use serde::{Deserialize, Serialize};

/// A single geotagged police alert report.
///
/// Coordinates are optional because the upstream feed occasionally emits
/// reports without a usable location. Such events still count towards the
/// raw table but are excluded from every grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Upstream report identifier (unique across the store).
    pub id: String,
    /// Time the report was published, in milliseconds since the Unix epoch.
    pub timestamp_millis: i64,
    /// Longitude (WGS84). `None` if the report had no location.
    pub longitude: Option<f64>,
    /// Latitude (WGS84). `None` if the report had no location.
    pub latitude: Option<f64>,
    /// Upstream confidence rating for the report.
    #[serde(default)]
    pub confidence: i32,
    /// Upstream reliability rating for the reporting user.
    #[serde(default)]
    pub reliability: i32,
}

impl AlertEvent {
    /// Returns the `(longitude, latitude)` pair if both coordinates are
    /// present and finite.
    #[must_use]
    pub fn location(&self) -> Option<(f64, f64)> {
        match (self.longitude, self.latitude) {
            (Some(lon), Some(lat)) if lon.is_finite() && lat.is_finite() => Some((lon, lat)),
            _ => None,
        }
    }

    /// Whether this event can participate in grid aggregation.
    #[must_use]
    pub fn is_mappable(&self) -> bool {
        self.location().is_some()
    }
}
