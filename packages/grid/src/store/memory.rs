//! In-memory [`EventSource`] and [`GridSink`] implementations.
//!
//! Used by the pipeline tests and by callers that want to inspect a run's
//! output without a database. The sink enforces the same primary keys and
//! batch atomicity as the `DuckDB` store and can be told to fail specific
//! batches.

use std::collections::{BTreeMap, BTreeSet};

use alert_map_alert_models::AlertEvent;
use alert_map_grid_models::{
    CellKey, DensityCell, DiversityCell, MetadataKey, StoreError, TimeRange,
};

use super::{EventSource, GridSink};

/// Event source backed by a plain vector.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSource {
    events: Vec<AlertEvent>,
}

impl MemoryEventSource {
    #[must_use]
    pub const fn new(events: Vec<AlertEvent>) -> Self {
        Self { events }
    }

    fn mappable(&self) -> impl Iterator<Item = &AlertEvent> {
        self.events.iter().filter(|e| e.is_mappable())
    }
}

impl EventSource for MemoryEventSource {
    fn max_timestamp(&self) -> Result<Option<i64>, StoreError> {
        Ok(self.events.iter().map(|e| e.timestamp_millis).max())
    }

    fn mappable_events_in(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError> {
        Ok(self
            .mappable()
            .filter(|e| range.contains(e.timestamp_millis))
            .cloned()
            .collect())
    }

    fn mappable_events_since(&self, start_ms: i64) -> Result<Vec<AlertEvent>, StoreError> {
        Ok(self
            .mappable()
            .filter(|e| e.timestamp_millis >= start_ms)
            .cloned()
            .collect())
    }

    fn count_mappable_in(&self, range: TimeRange) -> Result<u64, StoreError> {
        Ok(self
            .mappable()
            .filter(|e| range.contains(e.timestamp_millis))
            .count() as u64)
    }
}

/// One generation of grid tables, keyed like the `DuckDB` primary keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridTables {
    /// `(time_window_id, level, cell) -> density`
    pub density: BTreeMap<(u32, u8, CellKey), u8>,
    /// `(radius_group_id, level, cell) -> score`
    pub diversity: BTreeMap<(u32, u8, CellKey), u32>,
    pub metadata: BTreeMap<MetadataKey, String>,
}

impl GridTables {
    /// Density rows for one `(window, level)`.
    #[must_use]
    pub fn density_level(&self, time_window_id: u32, level: u8) -> BTreeMap<CellKey, u8> {
        self.density
            .iter()
            .filter(|((w, l, _), _)| *w == time_window_id && *l == level)
            .map(|((_, _, cell), d)| (*cell, *d))
            .collect()
    }

    /// Diversity rows for one `(radius group, level)`.
    #[must_use]
    pub fn diversity_level(&self, radius_group_id: u32, level: u8) -> BTreeMap<CellKey, u32> {
        self.diversity
            .iter()
            .filter(|((g, l, _), _)| *g == radius_group_id && *l == level)
            .map(|((_, _, cell), s)| (*cell, *s))
            .collect()
    }
}

/// Grid sink that keeps a staged and a published generation in memory.
#[derive(Debug, Default)]
pub struct MemoryGridSink {
    staged: Option<GridTables>,
    published: GridTables,
    failing_density: BTreeSet<(u32, u8)>,
    failing_diversity: BTreeSet<(u32, u8)>,
}

impl MemoryGridSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every density batch for `(time_window_id, level)` fail.
    pub fn fail_density_writes(&mut self, time_window_id: u32, level: u8) {
        self.failing_density.insert((time_window_id, level));
    }

    /// Makes every diversity batch for `(radius_group_id, level)` fail.
    pub fn fail_diversity_writes(&mut self, radius_group_id: u32, level: u8) {
        self.failing_diversity.insert((radius_group_id, level));
    }

    /// The last generation published by [`GridSink::finish_rebuild`].
    #[must_use]
    pub const fn published(&self) -> &GridTables {
        &self.published
    }

    /// The generation currently being rebuilt, if any.
    #[must_use]
    pub const fn staged(&self) -> Option<&GridTables> {
        self.staged.as_ref()
    }

    fn staged_mut(&mut self) -> Result<&mut GridTables, StoreError> {
        self.staged
            .as_mut()
            .ok_or_else(|| StoreError::Backend("no rebuild in progress".into()))
    }
}

fn injected_failure(kind: &str, unit: (u32, u8)) -> StoreError {
    StoreError::Backend(format!("injected {kind} write failure for {unit:?}").into())
}

fn duplicate_key(kind: &str, key: (u32, u8, CellKey)) -> StoreError {
    StoreError::Backend(format!("duplicate {kind} key {key:?}").into())
}

impl GridSink for MemoryGridSink {
    fn begin_rebuild(&mut self) -> Result<(), StoreError> {
        self.staged = Some(GridTables::default());
        Ok(())
    }

    fn write_density(&mut self, cells: &[DensityCell]) -> Result<(), StoreError> {
        if let Some(unit) = cells
            .iter()
            .map(|c| (c.time_window_id, c.level))
            .find(|unit| self.failing_density.contains(unit))
        {
            return Err(injected_failure("density", unit));
        }

        let tables = self.staged_mut()?;
        let mut seen = BTreeSet::new();
        for c in cells {
            let key = (c.time_window_id, c.level, c.cell);
            if tables.density.contains_key(&key) || !seen.insert(key) {
                return Err(duplicate_key("density", key));
            }
        }
        for c in cells {
            tables
                .density
                .insert((c.time_window_id, c.level, c.cell), c.density);
        }
        Ok(())
    }

    fn write_diversity(&mut self, cells: &[DiversityCell]) -> Result<(), StoreError> {
        if let Some(unit) = cells
            .iter()
            .map(|c| (c.radius_group_id, c.level))
            .find(|unit| self.failing_diversity.contains(unit))
        {
            return Err(injected_failure("diversity", unit));
        }

        let tables = self.staged_mut()?;
        let mut seen = BTreeSet::new();
        for c in cells {
            let key = (c.radius_group_id, c.level, c.cell);
            if tables.diversity.contains_key(&key) || !seen.insert(key) {
                return Err(duplicate_key("diversity", key));
            }
        }
        for c in cells {
            tables
                .diversity
                .insert((c.radius_group_id, c.level, c.cell), c.score);
        }
        Ok(())
    }

    fn read_diversity(
        &self,
        radius_group_id: u32,
        level: u8,
    ) -> Result<Vec<DiversityCell>, StoreError> {
        let tables = self
            .staged
            .as_ref()
            .ok_or_else(|| StoreError::Backend("no rebuild in progress".into()))?;

        Ok(tables
            .diversity_level(radius_group_id, level)
            .into_iter()
            .map(|(cell, score)| DiversityCell {
                radius_group_id,
                level,
                cell,
                score,
            })
            .collect())
    }

    fn write_metadata(&mut self, entries: &[(MetadataKey, String)]) -> Result<(), StoreError> {
        let tables = self.staged_mut()?;
        tables.metadata = entries.iter().cloned().collect();
        Ok(())
    }

    fn finish_rebuild(&mut self) -> Result<(), StoreError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| StoreError::Backend("no rebuild in progress".into()))?;
        self.published = staged;
        Ok(())
    }
}
