//! Storage seams between the aggregation pipelines and their backends.
//!
//! The pipelines read raw events through an [`EventSource`] and write grid
//! rows through a [`GridSink`]. Each `write_*` call is one atomic batch: it
//! either lands completely or fails as a unit.

pub mod memory;

use alert_map_alert_models::AlertEvent;
use alert_map_grid_models::{
    DensityCell, DiversityCell, MetadataKey, StoreError, TimeRange,
};

/// Read access to the raw alert event table.
pub trait EventSource {
    /// Largest stored `timestamp_millis`, or `None` if the store is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend query fails.
    fn max_timestamp(&self) -> Result<Option<i64>, StoreError>;

    /// All events with coordinates whose timestamp falls in `range`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend query fails.
    fn mappable_events_in(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError>;

    /// All events with coordinates and `timestamp_millis >= start_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend query fails.
    fn mappable_events_since(&self, start_ms: i64) -> Result<Vec<AlertEvent>, StoreError>;

    /// Number of events with coordinates whose timestamp falls in `range`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend query fails.
    fn count_mappable_in(&self, range: TimeRange) -> Result<u64, StoreError>;
}

/// Write access to the generated grid tables.
///
/// A run calls [`GridSink::begin_rebuild`] once, then any number of batch
/// writes and diversity read-backs, then [`GridSink::finish_rebuild`].
/// Reads during a rebuild observe the rows written so far in that rebuild.
pub trait GridSink {
    /// Discards any previous in-progress rebuild and prepares empty grid
    /// structures.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the structures cannot be created.
    fn begin_rebuild(&mut self) -> Result<(), StoreError>;

    /// Persists one `(time window, level)` batch of density rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch could not be written. Nothing
    /// from the batch is kept in that case.
    fn write_density(&mut self, cells: &[DensityCell]) -> Result<(), StoreError>;

    /// Persists one `(radius group, level)` batch of diversity rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch could not be written. Nothing
    /// from the batch is kept in that case.
    fn write_diversity(&mut self, cells: &[DiversityCell]) -> Result<(), StoreError>;

    /// Reads back every diversity row written for `(radius_group_id, level)`
    /// in the current rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend query fails.
    fn read_diversity(
        &self,
        radius_group_id: u32,
        level: u8,
    ) -> Result<Vec<DiversityCell>, StoreError>;

    /// Replaces the metadata table with `entries`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn write_metadata(&mut self, entries: &[(MetadataKey, String)]) -> Result<(), StoreError>;

    /// Publishes the rebuilt grids, replacing the previous generation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the swap fails; the previous generation
    /// stays visible in that case.
    fn finish_rebuild(&mut self) -> Result<(), StoreError>;
}
