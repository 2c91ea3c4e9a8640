//! Multi-resolution density grids.
//!
//! For every time window, events are bucketed into cells at each precision
//! level independently. Counts are compressed with `ln(1 + count)` before
//! min/max normalization onto `0..=255` so that a handful of very busy cells
//! do not flatten everything else to the bottom of the range. Cells that
//! normalize to zero are not stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use alert_map_alert_models::AlertEvent;
use alert_map_grid_models::{CellKey, DENSITY_SCALE, DensityCell, GridConfig, StoreError};
use rayon::prelude::*;

use crate::PipelineReport;
use crate::normalize::{min_max, normalize};
use crate::progress::ProgressCallback;
use crate::scale::cell_key;
use crate::store::{EventSource, GridSink};

/// Event count per cell at one level.
#[must_use]
pub fn count_cells(events: &[AlertEvent], level: u8) -> BTreeMap<CellKey, u64> {
    let mut counts = BTreeMap::new();
    for (lon, lat) in events.iter().filter_map(AlertEvent::location) {
        if let Some(key) = cell_key(lon, lat, level) {
            *counts.entry(key).or_insert(0u64) += 1;
        }
    }
    counts
}

/// Normalized, non-zero densities for one level.
#[must_use]
pub fn density_level(events: &[AlertEvent], level: u8) -> BTreeMap<CellKey, u8> {
    #[allow(clippy::cast_precision_loss)]
    let log_counts: Vec<(CellKey, f64)> = count_cells(events, level)
        .into_iter()
        .map(|(key, count)| (key, (count as f64).ln_1p()))
        .collect();

    let range = min_max(log_counts.iter().map(|(_, v)| Some(*v)));

    log_counts
        .into_iter()
        .filter_map(|(key, value)| {
            let density = u8::try_from(normalize(Some(value), range, DENSITY_SCALE)).ok()?;
            (density > 0).then_some((key, density))
        })
        .collect()
}

/// Computes every configured level for one window's events, finest first.
/// Levels without any surviving cell are omitted.
#[must_use]
pub fn density_window(
    events: &[AlertEvent],
    config: &GridConfig,
) -> Vec<(u8, BTreeMap<CellKey, u8>)> {
    config
        .levels_descending()
        .map(|level| (level, density_level(events, level)))
        .filter(|(_, cells)| !cells.is_empty())
        .collect()
}

/// Rebuilds the density grids for all configured time windows.
///
/// Windows are read from `source` in id order, computed in parallel, and
/// written level by level. A failed batch write is logged and skipped; it
/// does not stop the remaining levels or windows.
///
/// # Errors
///
/// Returns [`StoreError`] only if reading events from `source` fails.
pub fn run_density<S, G>(
    source: &S,
    sink: &mut G,
    config: &GridConfig,
    reference_ms: i64,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<PipelineReport, StoreError>
where
    S: EventSource + ?Sized,
    G: GridSink + ?Sized,
{
    let mut windows = config.time_windows.clone();
    windows.sort_by_key(|w| w.id);

    let mut inputs = Vec::with_capacity(windows.len());
    for window in &windows {
        let events = source.mappable_events_in(window.range(reference_ms))?;
        if events.is_empty() {
            log::debug!("Density window {}: no events, skipping", window.id);
            continue;
        }
        log::info!("Density window {}: {} events", window.id, events.len());
        inputs.push((window.id, events));
    }

    let computed: Vec<(u32, Vec<(u8, BTreeMap<CellKey, u8>)>)> = inputs
        .par_iter()
        .map(|(window_id, events)| (*window_id, density_window(events, config)))
        .collect();

    let mut report = PipelineReport::default();
    let mut computed = computed.into_iter().peekable();

    for window in &windows {
        progress.set_message(format!("Density window {}", window.id));

        if let Some((_, levels)) = computed.next_if(|(id, _)| *id == window.id) {
            for (level, cells) in levels {
                let rows: Vec<DensityCell> = cells
                    .into_iter()
                    .map(|(cell, density)| DensityCell {
                        time_window_id: window.id,
                        level,
                        cell,
                        density,
                    })
                    .collect();

                match sink.write_density(&rows) {
                    Ok(()) => {
                        log::debug!(
                            "Density window {} level {level}: wrote {} cells",
                            window.id,
                            rows.len()
                        );
                        report.cells_written += rows.len() as u64;
                    }
                    Err(e) => {
                        log::error!(
                            "Density window {} level {level}: write failed, skipping: {e}",
                            window.id
                        );
                        report.failed_units += 1;
                    }
                }
            }
        }

        progress.inc(1);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use alert_map_grid_models::{BoundingBox, DAY_MS, TimeWindow};

    use super::*;
    use crate::progress::null_progress;
    use crate::store::memory::{MemoryEventSource, MemoryGridSink};

    const REFERENCE: i64 = 100 * DAY_MS;

    fn event(id: &str, lon: f64, lat: f64, timestamp_millis: i64) -> AlertEvent {
        AlertEvent {
            id: id.to_string(),
            timestamp_millis,
            longitude: Some(lon),
            latitude: Some(lat),
            confidence: 0,
            reliability: 5,
        }
    }

    fn config() -> GridConfig {
        GridConfig {
            time_windows: vec![
                TimeWindow {
                    id: 0,
                    days_ago_start: 0,
                    days_ago_end: 7,
                },
                TimeWindow {
                    id: 1,
                    days_ago_start: 7,
                    days_ago_end: 30,
                },
            ],
            radius_groups: vec![0.0001],
            min_level: 0,
            max_level: 5,
            area: BoundingBox {
                top: 21.0,
                bottom: 19.0,
                left: 9.0,
                right: 11.0,
            },
        }
    }

    /// Three events in one level-5 cell and one in its neighbour.
    fn hot_and_cold() -> Vec<AlertEvent> {
        let ts = REFERENCE - DAY_MS;
        vec![
            event("a1", 10.000_015, 20.000_015, ts),
            event("a2", 10.000_016, 20.000_017, ts),
            event("a3", 10.000_018, 20.000_011, ts),
            event("b1", 10.000_025, 20.000_015, ts),
        ]
    }

    #[test]
    fn counts_per_cell() {
        let counts = count_cells(&hot_and_cold(), 5);
        assert_eq!(counts.get(&CellKey::new(1_000_001, 2_000_001)), Some(&3));
        assert_eq!(counts.get(&CellKey::new(1_000_002, 2_000_001)), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn least_busy_cell_normalizes_to_zero_and_is_dropped() {
        let cells = density_level(&hot_and_cold(), 5);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells.get(&CellKey::new(1_000_001, 2_000_001)), Some(&255));
    }

    #[test]
    fn single_cell_is_maximal() {
        // All four events share a level-4 cell.
        let cells = density_level(&hot_and_cold(), 4);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells.values().copied().collect::<Vec<_>>(), vec![255]);
    }

    #[test]
    fn log_scaling_spreads_mid_range_cells() {
        let ts = REFERENCE - DAY_MS;
        let mut events = Vec::new();
        for i in 0..15 {
            events.push(event(&format!("hot{i}"), 1.5, 1.5, ts));
        }
        for i in 0..3 {
            events.push(event(&format!("mid{i}"), 2.5, 2.5, ts));
        }
        events.push(event("cold", 3.5, 3.5, ts));

        let cells = density_level(&events, 0);
        // ln(16), ln(4), ln(2): the middle cell lands exactly half way.
        assert_eq!(cells.get(&CellKey::new(1, 1)), Some(&255));
        assert_eq!(cells.get(&CellKey::new(2, 2)), Some(&85));
        assert_eq!(cells.get(&CellKey::new(3, 3)), None);
    }

    #[test]
    fn events_without_scalable_coordinates_are_ignored() {
        let ts = REFERENCE - DAY_MS;
        let events = vec![
            event("zero", 0.0, 20.5, ts),
            event("ok", 10.5, 20.5, ts),
            AlertEvent {
                longitude: None,
                ..event("none", 10.5, 20.5, ts)
            },
        ];
        let counts = count_cells(&events, 0);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get(&CellKey::new(10, 20)), Some(&1));
    }

    #[test]
    fn run_writes_each_window_and_level_independently() {
        let mut events = hot_and_cold();
        // An older event in window 1, far away from the others.
        events.push(event("old", -10.5, -20.5, REFERENCE - 10 * DAY_MS));
        let source = MemoryEventSource::new(events);
        let mut sink = MemoryGridSink::new();
        sink.begin_rebuild().unwrap();

        let report = run_density(&source, &mut sink, &config(), REFERENCE, &null_progress()).unwrap();
        let tables = sink.staged().unwrap();

        assert_eq!(report.failed_units, 0);
        // Window 0: one cell survives at level 5, one cell at levels 0..=4.
        assert_eq!(tables.density_level(0, 5).len(), 1);
        for level in 0..=4 {
            assert_eq!(tables.density_level(0, level).len(), 1, "level {level}");
        }
        // Window 1: the single event is maximal at every level.
        for level in 0..=5 {
            let cells = tables.density_level(1, level);
            assert_eq!(cells.values().copied().collect::<Vec<_>>(), vec![255]);
        }
        assert_eq!(
            tables.density_level(1, 0).keys().copied().collect::<Vec<_>>(),
            vec![CellKey::new(-10, -20)]
        );
        assert_eq!(report.cells_written, 12);
    }

    #[test]
    fn window_bounds_are_half_open() {
        let events = vec![
            // The older edge of window 0 is inclusive.
            event("edge", 10.5, 20.5, REFERENCE - 7 * DAY_MS),
            // One millisecond earlier falls into window 1.
            event("older", 12.5, 22.5, REFERENCE - 7 * DAY_MS - 1),
            // The newer edge of window 0 (the reference instant) is exclusive.
            event("now", 11.5, 21.5, REFERENCE),
        ];
        let source = MemoryEventSource::new(events);
        let mut sink = MemoryGridSink::new();
        sink.begin_rebuild().unwrap();

        run_density(&source, &mut sink, &config(), REFERENCE, &null_progress()).unwrap();
        let tables = sink.staged().unwrap();

        assert_eq!(
            tables.density_level(0, 0).keys().copied().collect::<Vec<_>>(),
            vec![CellKey::new(10, 20)]
        );
        assert_eq!(
            tables.density_level(1, 0).keys().copied().collect::<Vec<_>>(),
            vec![CellKey::new(12, 22)]
        );
        assert!(
            !tables
                .density
                .keys()
                .any(|(_, level, cell)| *level == 0 && *cell == CellKey::new(11, 21))
        );
    }

    #[test]
    fn failed_level_does_not_stop_other_levels() {
        let source = MemoryEventSource::new(hot_and_cold());
        let mut sink = MemoryGridSink::new();
        sink.fail_density_writes(0, 3);
        sink.begin_rebuild().unwrap();

        let report = run_density(&source, &mut sink, &config(), REFERENCE, &null_progress()).unwrap();
        let tables = sink.staged().unwrap();

        assert_eq!(report.failed_units, 1);
        assert!(tables.density_level(0, 3).is_empty());
        assert_eq!(tables.density_level(0, 2).len(), 1);
        assert_eq!(tables.density_level(0, 5).len(), 1);
    }

    #[test]
    fn empty_store_writes_nothing() {
        let source = MemoryEventSource::new(Vec::new());
        let mut sink = MemoryGridSink::new();
        sink.begin_rebuild().unwrap();

        let report = run_density(&source, &mut sink, &config(), REFERENCE, &null_progress()).unwrap();

        assert_eq!(report, PipelineReport::default());
        assert!(sink.staged().unwrap().density.is_empty());
    }
}
