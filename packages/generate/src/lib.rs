#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Rebuilds the police alert map grids from the events database.
//!
//! A run picks a reference timestamp (the newest stored alert, or now when
//! the store is empty), rebuilds the density grids and then the temporal
//! diversity grids against that timestamp, writes a small metadata summary,
//! and publishes everything in one swap. Failures on individual window or
//! radius levels are logged and counted; failures to read events or to set
//! up or publish the grid store abort the run.
//!
//! The crate also hosts the NDJSON importer used to seed the events
//! database and the summary behind the `stats` subcommand.

pub mod config;
pub mod interactive;

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alert_map_alert_models::AlertEvent;
use alert_map_database::DbError;
use alert_map_database::events_db::EventStore;
use alert_map_database::grids_db::{GridStore, LevelCount};
use alert_map_grid::density::run_density;
use alert_map_grid::diversity::run_diversity;
use alert_map_grid::progress::ProgressCallback;
use alert_map_grid::{EventSource, GridSink, PipelineReport};
use alert_map_grid_models::{GridConfig, MetadataKey, StoreError};

use crate::config::ConfigError;

/// Events parsed per insert batch during import.
const IMPORT_BATCH_SIZE: usize = 5_000;

/// Errors that abort a generate command.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    /// Reading events or setting up/publishing grids failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Opening a database failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Reading an input file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A user-selected command, from the CLI or the interactive menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Full grid rebuild.
    Run {
        events_db: PathBuf,
        grids_db: PathBuf,
        config: Option<PathBuf>,
    },
    /// Load NDJSON alert events into the events database.
    Import { file: PathBuf, events_db: PathBuf },
    /// Print the published grid summary.
    Stats { grids_db: PathBuf },
}

/// Outcome of one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Epoch milliseconds all windows were measured from.
    pub reference_ms: i64,
    pub density: PipelineReport,
    pub diversity: PipelineReport,
    /// Mappable alerts inside the configured horizon.
    pub total_alerts: u64,
    /// Whether the metadata batch was written.
    pub metadata_written: bool,
}

impl RunSummary {
    /// Units skipped across both pipelines and the metadata write.
    #[must_use]
    pub fn failed_units(&self) -> u32 {
        self.density.failed_units + self.diversity.failed_units + u32::from(!self.metadata_written)
    }
}

/// Metadata entries describing one run.
#[must_use]
pub fn metadata_entries(
    config: &GridConfig,
    reference_ms: i64,
    total_alerts: u64,
) -> Vec<(MetadataKey, String)> {
    let (center_lon, center_lat) = config.area.center();
    vec![
        (MetadataKey::LastUpdate, reference_ms.to_string()),
        (MetadataKey::CenterLon, center_lon.to_string()),
        (MetadataKey::CenterLat, center_lat.to_string()),
        (MetadataKey::TotalAlerts, total_alerts.to_string()),
    ]
}

/// Rebuilds every grid from `source` into `sink`.
///
/// # Errors
///
/// Returns [`GenerateError`] if reading from `source` fails, or if `sink`
/// cannot begin or publish the rebuild. Per-level write failures are only
/// counted in the returned [`RunSummary`].
pub fn run<S, G>(
    source: &S,
    sink: &mut G,
    config: &GridConfig,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<RunSummary, GenerateError>
where
    S: EventSource + ?Sized,
    G: GridSink + ?Sized,
{
    let reference_ms = match source.max_timestamp()? {
        Some(ts) => ts,
        None => {
            log::warn!("Event store is empty, measuring windows from the current time");
            chrono::Utc::now().timestamp_millis()
        }
    };
    log::info!("Reference timestamp: {reference_ms}");

    progress.set_total((config.time_windows.len() + config.radius_groups.len()) as u64);

    sink.begin_rebuild()?;

    let density = run_density(source, sink, config, reference_ms, progress)?;
    log::info!(
        "Density grids: {} cells, {} failed units",
        density.cells_written,
        density.failed_units
    );

    let diversity = run_diversity(source, sink, config, reference_ms, progress)?;
    log::info!(
        "Diversity grids: {} cells, {} failed units",
        diversity.cells_written,
        diversity.failed_units
    );

    let total_alerts = match config.horizon(reference_ms) {
        Some(horizon) => source.count_mappable_in(horizon)?,
        None => 0,
    };

    let metadata_written = match sink.write_metadata(&metadata_entries(
        config,
        reference_ms,
        total_alerts,
    )) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Metadata write failed, skipping: {e}");
            false
        }
    };

    sink.finish_rebuild()?;

    let summary = RunSummary {
        reference_ms,
        density,
        diversity,
        total_alerts,
        metadata_written,
    };
    progress.finish(format!(
        "Wrote {} grid cells",
        summary.density.cells_written + summary.diversity.cells_written
    ));

    Ok(summary)
}

/// Opens both `DuckDB` files and runs a full rebuild.
///
/// # Errors
///
/// Returns [`GenerateError`] if either database cannot be opened or the run
/// fails.
pub fn run_files(
    events_db: &Path,
    grids_db: &Path,
    config: &GridConfig,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<RunSummary, GenerateError> {
    log::info!("Reading events from {}", events_db.display());
    let source = EventStore::open(events_db)?;
    log::info!("Writing grids to {}", grids_db.display());
    let mut sink = GridStore::open(grids_db)?;

    run(&source, &mut sink, config, progress)
}

/// Counters from an NDJSON import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Non-blank lines that parsed as alert events.
    pub parsed: u64,
    /// Events that were new to the store.
    pub inserted: u64,
    /// Non-blank lines that failed to parse and were skipped.
    pub malformed: u64,
}

fn flush_batch(
    store: &EventStore,
    batch: &mut Vec<AlertEvent>,
    report: &mut ImportReport,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<(), GenerateError> {
    if batch.is_empty() {
        return Ok(());
    }
    report.inserted += store.insert_events(batch)?;
    progress.inc(batch.len() as u64);
    batch.clear();
    Ok(())
}

/// Loads newline-delimited JSON alert events from `reader` into `store`.
///
/// Lines that are not valid events are logged and skipped. Events whose id
/// is already stored are ignored.
///
/// # Errors
///
/// Returns [`GenerateError`] if reading input or inserting a batch fails.
pub fn import_events<R: BufRead>(
    store: &EventStore,
    reader: R,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<ImportReport, GenerateError> {
    let mut report = ImportReport::default();
    let mut batch = Vec::with_capacity(IMPORT_BATCH_SIZE);

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<AlertEvent>(&line) {
            Ok(event) => {
                report.parsed += 1;
                batch.push(event);
            }
            Err(e) => {
                log::warn!("Line {}: skipping malformed event: {e}", i + 1);
                report.malformed += 1;
            }
        }

        if batch.len() >= IMPORT_BATCH_SIZE {
            flush_batch(store, &mut batch, &mut report, progress)?;
        }
    }
    flush_batch(store, &mut batch, &mut report, progress)?;

    progress.finish(format!("Imported {} new alerts", report.inserted));
    Ok(report)
}

/// Published grid summary shown by the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridStats {
    pub metadata: BTreeMap<MetadataKey, String>,
    pub density: Vec<LevelCount>,
    pub diversity: Vec<LevelCount>,
}

impl GridStats {
    /// Reads the summary from the published tables.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if any query fails.
    pub fn collect(store: &GridStore) -> Result<Self, DbError> {
        Ok(Self {
            metadata: store.metadata()?,
            density: store.density_level_counts()?,
            diversity: store.diversity_level_counts()?,
        })
    }
}

impl std::fmt::Display for GridStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.metadata.is_empty() {
            writeln!(f, "No published grids")?;
        }
        for (key, value) in &self.metadata {
            writeln!(f, "{key:>14}: {value}")?;
        }

        for (title, id_label, counts) in [
            ("Density", "window", &self.density),
            ("Diversity", "radius group", &self.diversity),
        ] {
            writeln!(f)?;
            writeln!(f, "{title} rows:")?;
            for count in counts {
                writeln!(
                    f,
                    "  {id_label} {} level {}: {}",
                    count.id, count.level, count.rows
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alert_map_grid::progress::null_progress;
    use alert_map_grid::store::memory::{MemoryEventSource, MemoryGridSink};
    use alert_map_grid_models::{BoundingBox, CellKey, DAY_MS, TimeWindow};

    use super::*;

    const REFERENCE: i64 = 400 * DAY_MS;

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
            radius_groups: vec![0.000_001, 0.000_01],
            min_level: 0,
            max_level: 5,
            area: BoundingBox {
                top: 1.0,
                bottom: -1.0,
                left: -1.0,
                right: 1.0,
            },
        }
    }

    /// Cell A holds two recent events plus one at the reference instant,
    /// its neighbour B only an older event, and C (two cells north of A) a
    /// single recent event.
    fn events() -> Vec<AlertEvent> {
        vec![
            event("a1", 10.000_015, 20.000_015, REFERENCE - DAY_MS),
            event("a2", 10.000_016, 20.000_017, REFERENCE - DAY_MS),
            event("a3", 10.000_018, 20.000_011, REFERENCE),
            event("b_old", 10.000_025, 20.000_015, REFERENCE - 10 * DAY_MS),
            event("c1", 10.000_015, 20.000_035, REFERENCE - 2 * DAY_MS),
            AlertEvent {
                latitude: None,
                ..event("unmapped", 0.0, 0.0, REFERENCE - DAY_MS)
            },
        ]
    }

    fn event_store(events: &[AlertEvent]) -> EventStore {
        let store = EventStore::open_in_memory().unwrap();
        store.insert_events(events).unwrap();
        store
    }

    #[test]
    fn end_to_end_against_duckdb() {
        let source = event_store(&events());
        let mut sink = GridStore::open_in_memory().unwrap();

        let summary = run(&source, &mut sink, &config(), &null_progress()).unwrap();

        assert_eq!(summary.reference_ms, REFERENCE);
        assert_eq!(summary.failed_units(), 0);
        // a3 sits at the reference instant, past the newest edge of the horizon.
        assert_eq!(summary.total_alerts, 4);

        let a = CellKey::new(1_000_001, 2_000_001);
        let b = CellKey::new(1_000_002, 2_000_001);
        let c = CellKey::new(1_000_001, 2_000_003);

        // Window 0 at level 5: A has 2 events, C has 1, so only A survives.
        let cells = sink.density_cells(0, 5).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].cell, a);
        assert_eq!(cells[0].density, 255);

        // Zero half-width: every cell only sees its own window.
        let narrow = sink.diversity_cells(0, 5).unwrap();
        assert_eq!(narrow.len(), 3);
        assert!(narrow.iter().all(|cell| cell.score == 1));

        // Half-width one: A (window 0) and B (window 1) see each other, C is
        // two cells away from both.
        let wide: Vec<(CellKey, u32)> = sink
            .diversity_cells(1, 5)
            .unwrap()
            .iter()
            .map(|cell| (cell.cell, cell.score))
            .collect();
        assert_eq!(wide, vec![(a, 2), (c, 1), (b, 2)]);

        // Roll-up keeps the max of the children.
        let coarse = sink.diversity_cells(1, 0).unwrap();
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].cell, CellKey::new(10, 20));
        assert_eq!(coarse[0].score, 2);
        assert_eq!(sink.diversity_cells(0, 0).unwrap()[0].score, 1);

        let metadata = sink.metadata().unwrap();
        assert_eq!(
            metadata.get(&MetadataKey::LastUpdate),
            Some(&REFERENCE.to_string())
        );
        assert_eq!(metadata.get(&MetadataKey::CenterLon), Some(&"0".to_string()));
        assert_eq!(metadata.get(&MetadataKey::CenterLat), Some(&"0".to_string()));
        assert_eq!(metadata.get(&MetadataKey::TotalAlerts), Some(&"4".to_string()));
    }

    #[test]
    fn rerun_over_unchanged_store_is_identical() {
        let source = MemoryEventSource::new(events());
        let mut sink = MemoryGridSink::new();

        run(&source, &mut sink, &config(), &null_progress()).unwrap();
        let first = sink.published().clone();
        run(&source, &mut sink, &config(), &null_progress()).unwrap();

        assert_eq!(sink.published(), &first);
        assert!(!first.density.is_empty());
        assert!(!first.diversity.is_empty());
    }

    #[test]
    fn empty_store_publishes_metadata_only() {
        let source = MemoryEventSource::new(Vec::new());
        let mut sink = MemoryGridSink::new();

        let summary = run(&source, &mut sink, &config(), &null_progress()).unwrap();
        let published = sink.published();

        assert_eq!(summary.total_alerts, 0);
        assert!(published.density.is_empty());
        assert!(published.diversity.is_empty());
        assert_eq!(published.metadata.len(), MetadataKey::ALL.len());
        assert_eq!(
            published.metadata.get(&MetadataKey::TotalAlerts),
            Some(&"0".to_string())
        );
    }

    #[test]
    fn failed_units_do_not_abort_the_run() {
        let source = MemoryEventSource::new(events());
        let mut sink = MemoryGridSink::new();
        sink.fail_density_writes(0, 5);
        sink.fail_diversity_writes(1, 5);

        let summary = run(&source, &mut sink, &config(), &null_progress()).unwrap();
        let published = sink.published();

        assert_eq!(summary.density.failed_units, 1);
        assert_eq!(summary.diversity.failed_units, 1);
        assert_eq!(summary.failed_units(), 2);
        assert!(published.density_level(0, 5).is_empty());
        assert!(!published.density_level(0, 4).is_empty());
        // Group 1 has nothing to roll up from, group 0 is intact.
        assert!(published.diversity_level(1, 4).is_empty());
        assert!(!published.diversity_level(0, 0).is_empty());
        assert!(published.metadata.contains_key(&MetadataKey::TotalAlerts));
    }

    #[test]
    fn metadata_center_is_area_midpoint() {
        let entries = metadata_entries(&config(), 42, 7);
        assert_eq!(
            entries,
            vec![
                (MetadataKey::LastUpdate, "42".to_string()),
                (MetadataKey::CenterLon, "0".to_string()),
                (MetadataKey::CenterLat, "0".to_string()),
                (MetadataKey::TotalAlerts, "7".to_string()),
            ]
        );
    }

    #[test]
    fn import_skips_blank_and_malformed_lines() {
        let store = EventStore::open_in_memory().unwrap();
        let input = concat!(
            r#"{"id":"x1","timestampMillis":1000,"longitude":1.5,"latitude":2.5,"reliability":5}"#,
            "\n\n",
            "not json\n",
            r#"{"id":"x2","timestampMillis":2000,"reliability":7}"#,
            "\n",
            r#"{"id":"x1","timestampMillis":3000,"longitude":1.5,"latitude":2.5,"reliability":5}"#,
            "\n",
        );

        let report = import_events(&store, input.as_bytes(), &null_progress()).unwrap();

        assert_eq!(
            report,
            ImportReport {
                parsed: 3,
                inserted: 2,
                malformed: 1,
            }
        );
        assert_eq!(store.record_count().unwrap(), 2);
        assert_eq!(store.max_timestamp().unwrap(), Some(2000));
    }

    #[test]
    fn stats_report_published_counts() {
        let source = event_store(&events());
        let mut sink = GridStore::open_in_memory().unwrap();
        run(&source, &mut sink, &config(), &null_progress()).unwrap();

        let stats = GridStats::collect(&sink).unwrap();
        assert_eq!(stats.metadata.len(), MetadataKey::ALL.len());
        // Two windows and six levels each.
        assert_eq!(stats.density.len(), 12);
        assert_eq!(stats.density[0].level, 5);

        let text = stats.to_string();
        assert!(text.contains("total_alerts: 4"));
        assert!(text.contains("radius group 1 level 0: 1"));
    }
}
