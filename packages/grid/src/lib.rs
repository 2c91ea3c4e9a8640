#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Grid aggregation engine for police alert events.
//!
//! Turns a flat table of timestamped lon/lat events into two families of
//! multi-resolution grids:
//!
//! - [`density`]: per time window and precision level, log-normalized event
//!   counts scaled to `0..=255`. Every level is computed straight from the
//!   raw events and normalized over its own value distribution.
//! - [`diversity`]: per neighborhood radius and precision level, the number
//!   of distinct recency buckets observed around each cell. Only the finest
//!   level is computed from events; coarser levels are rolled up from the
//!   rows already persisted for the next finer level.
//!
//! Storage is abstracted behind the [`store::EventSource`] and
//! [`store::GridSink`] traits so the same pipelines run against `DuckDB` in
//! production and against [`store::memory`] in tests.

pub mod density;
pub mod diversity;
pub mod normalize;
pub mod progress;
pub mod scale;
pub mod store;

pub use store::{EventSource, GridSink};

/// Outcome counters for one pipeline over a full run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Rows successfully handed to the grid sink.
    pub cells_written: u64,
    /// Units (one window/level or one radius group/level) that failed to
    /// read or write and were skipped.
    pub failed_units: u32,
}

impl PipelineReport {
    /// Adds another report's counters to this one.
    pub const fn merge(&mut self, other: Self) {
        self.cells_written += other.cells_written;
        self.failed_units += other.failed_units;
    }
}
