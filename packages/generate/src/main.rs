#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI tool for rebuilding the police alert map grids.
//!
//! Without a subcommand an interactive menu is shown.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use alert_map_cli_utils::{IndicatifProgress, MultiProgress};
use alert_map_database::events_db::EventStore;
use alert_map_database::grids_db::GridStore;
use alert_map_database::paths;
use alert_map_generate::{Action, GridStats, config, import_events, interactive, run_files};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "alert_map_generate", about = "Police alert grid generation tool")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild every density and diversity grid from the events database
    Run {
        /// Events `DuckDB` file (defaults to `data/alerts.duckdb`)
        #[arg(long, env = "ALERT_MAP_EVENTS_DB")]
        events_db: Option<PathBuf>,

        /// Grids `DuckDB` file (defaults to `data/generated/grids.duckdb`)
        #[arg(long, env = "ALERT_MAP_GRIDS_DB")]
        grids_db: Option<PathBuf>,

        /// TOML config replacing the built-in defaults
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load newline-delimited JSON alerts into the events database
    Import {
        /// NDJSON file, one alert object per line
        file: PathBuf,

        /// Events `DuckDB` file (defaults to `data/alerts.duckdb`)
        #[arg(long, env = "ALERT_MAP_EVENTS_DB")]
        events_db: Option<PathBuf>,
    },
    /// Print metadata and row counts of the published grids
    Stats {
        /// Grids `DuckDB` file (defaults to `data/generated/grids.duckdb`)
        #[arg(long, env = "ALERT_MAP_GRIDS_DB")]
        grids_db: Option<PathBuf>,
    },
}

impl Commands {
    fn into_action(self) -> Action {
        match self {
            Self::Run {
                events_db,
                grids_db,
                config,
            } => Action::Run {
                events_db: events_db.unwrap_or_else(paths::events_db_path),
                grids_db: grids_db.unwrap_or_else(paths::grids_db_path),
                config,
            },
            Self::Import { file, events_db } => Action::Import {
                file,
                events_db: events_db.unwrap_or_else(paths::events_db_path),
            },
            Self::Stats { grids_db } => Action::Stats {
                grids_db: grids_db.unwrap_or_else(paths::grids_db_path),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = alert_map_cli_utils::init_logger();
    let cli = Cli::parse();

    let action = match cli.command {
        Some(command) => command.into_action(),
        None => interactive::prompt(paths::events_db_path(), paths::grids_db_path())?,
    };

    execute(action, &multi).await
}

async fn execute(action: Action, multi: &MultiProgress) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        Action::Run {
            events_db,
            grids_db,
            config: config_path,
        } => {
            let config = config::load(config_path.as_deref())?;
            let progress = IndicatifProgress::steps_bar(multi, "Generating grids", 0);

            let summary = tokio::task::spawn_blocking(move || {
                run_files(&events_db, &grids_db, &config, &progress)
            })
            .await??;

            log::info!(
                "Done: {} density cells, {} diversity cells, {} alerts in horizon",
                summary.density.cells_written,
                summary.diversity.cells_written,
                summary.total_alerts
            );
            if summary.failed_units() > 0 {
                log::warn!(
                    "{} units failed and were skipped, see errors above",
                    summary.failed_units()
                );
            }
        }
        Action::Import { file, events_db } => {
            let progress = IndicatifProgress::batch_bar(multi, "Importing alerts");

            let report = tokio::task::spawn_blocking(move || {
                let reader = BufReader::new(File::open(&file)?);
                let store = EventStore::open(&events_db)?;
                import_events(&store, reader, &progress)
            })
            .await??;

            log::info!(
                "Imported {} new alerts ({} parsed, {} malformed lines skipped)",
                report.inserted,
                report.parsed,
                report.malformed
            );
        }
        Action::Stats { grids_db } => {
            let stats = tokio::task::spawn_blocking(move || {
                let store = GridStore::open(&grids_db)?;
                GridStats::collect(&store)
            })
            .await??;

            print!("{stats}");
        }
    }

    Ok(())
}
