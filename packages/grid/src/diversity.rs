//! Multi-resolution temporal diversity grids.
//!
//! The score of a cell answers: within this neighborhood, across how many
//! distinct recency buckets has activity been recorded? Each finest-level
//! cell contributes only its single most recent bucket, so a score of `n`
//! means `n` nearby cells disagree on which window they were last active in.
//! High scores flag sustained activity rather than a one-off spike.
//!
//! Only the finest level is computed from events. Every coarser level is
//! the per-parent maximum of the rows persisted for the next finer level,
//! read back from the sink, so level `L` strictly depends on level `L + 1`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use alert_map_alert_models::AlertEvent;
use alert_map_grid_models::{
    CellKey, DiversityCell, GridConfig, RadiusGroup, StoreError, TimeWindow,
};
use rayon::prelude::*;

use crate::PipelineReport;
use crate::progress::ProgressCallback;
use crate::scale::{cell_key, cell_resolution};
use crate::store::{EventSource, GridSink};

/// Absorbs binary representation error when dividing a radius by the cell
/// resolution, so that `0.0005 / 0.00001` yields 50 rather than 49.
const HALF_WIDTH_TOLERANCE: f64 = 1e-9;

/// Most recent time window observed in each finest-level cell.
///
/// Built once per run and shared read-only by every radius group.
#[derive(Debug, Clone, Default)]
pub struct RecencyIndex {
    level: u8,
    cells: HashMap<CellKey, u32>,
    window_count: usize,
}

impl RecencyIndex {
    /// Assigns every event to the first window (in id order) whose older
    /// edge it is not older than, then keeps the smallest window id per
    /// cell at `level`. Events older than every window are dropped.
    #[must_use]
    pub fn build(
        events: &[AlertEvent],
        windows: &[TimeWindow],
        reference_ms: i64,
        level: u8,
    ) -> Self {
        let mut lower_bounds: Vec<(u32, i64)> = windows
            .iter()
            .map(|w| (w.id, w.lower_bound_ms(reference_ms)))
            .collect();
        lower_bounds.sort_by_key(|(id, _)| *id);

        let mut cells: HashMap<CellKey, u32> = HashMap::new();

        for event in events {
            let Some(window_id) = lower_bounds
                .iter()
                .find(|(_, lower)| event.timestamp_millis >= *lower)
                .map(|(id, _)| *id)
            else {
                continue;
            };
            let Some(key) = event
                .location()
                .and_then(|(lon, lat)| cell_key(lon, lat, level))
            else {
                continue;
            };

            cells
                .entry(key)
                .and_modify(|w| *w = (*w).min(window_id))
                .or_insert(window_id);
        }

        let window_count = cells.values().collect::<BTreeSet<_>>().len();

        Self {
            level,
            cells,
            window_count,
        }
    }

    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Most recent window id seen in `cell`, if any event landed there.
    #[must_use]
    pub fn most_recent_window(&self, cell: CellKey) -> Option<u32> {
        self.cells.get(&cell).copied()
    }

    /// Number of distinct windows present anywhere in the index; no
    /// neighborhood can score higher.
    #[must_use]
    pub const fn window_count(&self) -> usize {
        self.window_count
    }

    /// Number of distinct windows among indexed cells within `half_width`
    /// cells (Chebyshev distance) of `anchor`.
    #[must_use]
    pub fn neighborhood_score(&self, anchor: CellKey, half_width: i64) -> u32 {
        let mut seen: BTreeSet<u32> = BTreeSet::new();
        let side = u64::try_from(half_width.saturating_mul(2).saturating_add(1)).unwrap_or(0);

        // Walk whichever is smaller: the square around the anchor or the
        // populated cells themselves.
        if side.saturating_mul(side) <= self.cells.len() as u64 {
            'scan: for d_lon in -half_width..=half_width {
                for d_lat in -half_width..=half_width {
                    if let Some(window) = self.cells.get(&anchor.offset(d_lon, d_lat)) {
                        seen.insert(*window);
                        if seen.len() == self.window_count {
                            break 'scan;
                        }
                    }
                }
            }
        } else {
            let reach = half_width.unsigned_abs();
            for (cell, window) in &self.cells {
                if anchor.chebyshev_distance(*cell) <= reach {
                    seen.insert(*window);
                    if seen.len() == self.window_count {
                        break;
                    }
                }
            }
        }

        u32::try_from(seen.len()).unwrap_or(u32::MAX)
    }
}

/// Number of cells a radius reaches on each side of an anchor at
/// `max_level`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn half_width_cells(radius: f64, max_level: u8) -> i64 {
    if !radius.is_finite() || radius <= 0.0 {
        return 0;
    }

    (radius / cell_resolution(max_level) + HALF_WIDTH_TOLERANCE).floor() as i64
}

/// Scores every indexed cell. Every anchor event sits in an indexed cell and
/// the score depends only on that cell, so this is the per-cell maximum over
/// all anchors.
#[must_use]
pub fn score_cells(index: &RecencyIndex, half_width: i64) -> BTreeMap<CellKey, u32> {
    index
        .cells
        .keys()
        .map(|&cell| (cell, index.neighborhood_score(cell, half_width)))
        .filter(|(_, score)| *score > 0)
        .collect()
}

/// Derives the next coarser level: each parent takes the maximum score of
/// its children. Non-positive results are dropped.
#[must_use]
pub fn roll_up(children: &[DiversityCell]) -> BTreeMap<CellKey, u32> {
    let mut parents: BTreeMap<CellKey, u32> = BTreeMap::new();
    for child in children {
        let parent = parents.entry(child.cell.parent()).or_insert(0);
        *parent = (*parent).max(child.score);
    }
    parents.retain(|_, score| *score > 0);
    parents
}

fn to_rows(radius_group_id: u32, level: u8, cells: BTreeMap<CellKey, u32>) -> Vec<DiversityCell> {
    cells
        .into_iter()
        .map(|(cell, score)| DiversityCell {
            radius_group_id,
            level,
            cell,
            score,
        })
        .collect()
}

fn write_level<G: GridSink + ?Sized>(
    sink: &mut G,
    rows: &[DiversityCell],
    radius_group_id: u32,
    level: u8,
    report: &mut PipelineReport,
) {
    match sink.write_diversity(rows) {
        Ok(()) => {
            log::debug!(
                "Diversity group {radius_group_id} level {level}: wrote {} cells",
                rows.len()
            );
            report.cells_written += rows.len() as u64;
        }
        Err(e) => {
            log::error!(
                "Diversity group {radius_group_id} level {level}: write failed, skipping: {e}"
            );
            report.failed_units += 1;
        }
    }
}

/// Persists one radius group's finest level, then rolls it up level by
/// level using the rows read back from `sink`.
fn persist_group<G: GridSink + ?Sized>(
    sink: &mut G,
    config: &GridConfig,
    group: RadiusGroup,
    finest: BTreeMap<CellKey, u32>,
) -> PipelineReport {
    let mut report = PipelineReport::default();

    if finest.is_empty() {
        log::debug!("Diversity group {}: no scored cells", group.id);
    } else {
        let rows = to_rows(group.id, config.max_level, finest);
        write_level(sink, &rows, group.id, config.max_level, &mut report);
    }

    for level in (config.min_level..config.max_level).rev() {
        let children = match sink.read_diversity(group.id, level + 1) {
            Ok(children) => children,
            Err(e) => {
                log::error!(
                    "Diversity group {} level {level}: read-back of level {} failed, skipping: {e}",
                    group.id,
                    level + 1
                );
                report.failed_units += 1;
                continue;
            }
        };

        if children.is_empty() {
            log::debug!(
                "Diversity group {} level {level}: no rows at level {}, skipping",
                group.id,
                level + 1
            );
            continue;
        }

        let parents = roll_up(&children);
        if parents.is_empty() {
            continue;
        }

        let rows = to_rows(group.id, level, parents);
        write_level(sink, &rows, group.id, level, &mut report);
    }

    report
}

/// Rebuilds the temporal diversity grids for all configured radius groups.
///
/// Builds the [`RecencyIndex`] once, scores every radius group in parallel
/// against it, and then persists and rolls up each group sequentially in id
/// order.
///
/// # Errors
///
/// Returns [`StoreError`] only if reading events from `source` fails.
pub fn run_diversity<S, G>(
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
    let mut report = PipelineReport::default();

    let Some(horizon_start) = config
        .time_windows
        .iter()
        .map(|w| w.lower_bound_ms(reference_ms))
        .min()
    else {
        log::warn!("No time windows configured, skipping diversity grids");
        return Ok(report);
    };

    let events = source.mappable_events_since(horizon_start)?;
    let index = RecencyIndex::build(&events, &config.time_windows, reference_ms, config.max_level);
    log::info!(
        "Diversity index: {} events over {} cells in {} windows",
        events.len(),
        index.len(),
        index.window_count()
    );

    let groups = config.radius_groups();
    let scored: Vec<(RadiusGroup, BTreeMap<CellKey, u32>)> = groups
        .par_iter()
        .map(|group| {
            let half_width = half_width_cells(group.radius, config.max_level);
            (*group, score_cells(&index, half_width))
        })
        .collect();

    for (group, finest) in scored {
        progress.set_message(format!("Diversity radius {}", group.radius));
        report.merge(persist_group(sink, config, group, finest));
        progress.inc(1);
    }

    Ok(report)
}
