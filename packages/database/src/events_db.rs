//! Raw alert event storage.
//!
//! The `alerts` table is append-only from the generator's point of view:
//! ingestion inserts deduplicated reports keyed by their upstream id, and
//! generation only ever reads.

use std::collections::HashSet;
use std::path::Path;

use alert_map_alert_models::AlertEvent;
use alert_map_grid::EventSource;
use alert_map_grid_models::{StoreError, TimeRange};
use duckdb::{Connection, params};

use crate::DbError;

/// Number of rows per INSERT chunk.
const CHUNK_SIZE: usize = 5_000;

/// Columns selected for every event read, in [`row_to_event`] order.
const EVENT_COLUMNS: &str = "id, timestamp_ms, longitude, latitude, confidence, reliability";

/// Shared predicate for events that can be placed on the grid.
const MAPPABLE: &str = "longitude IS NOT NULL AND latitude IS NOT NULL \
     AND isfinite(longitude) AND isfinite(latitude)";

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS alerts (
            id TEXT NOT NULL PRIMARY KEY,
            timestamp_ms BIGINT NOT NULL,
            longitude DOUBLE,
            latitude DOUBLE,
            confidence INTEGER NOT NULL DEFAULT 0,
            reliability INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

fn row_to_event(row: &duckdb::Row<'_>) -> duckdb::Result<AlertEvent> {
    Ok(AlertEvent {
        id: row.get(0)?,
        timestamp_millis: row.get(1)?,
        longitude: row.get(2)?,
        latitude: row.get(3)?,
        confidence: row.get(4)?,
        reliability: row.get(5)?,
    })
}

/// Read/append access to the alert events database.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Opens (or creates) the events database at `path` and ensures the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection, or schema creation
    /// fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        crate::paths::ensure_parent(path)?;
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a throwaway in-memory events database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if schema creation fails.
    pub fn from_connection(conn: Connection) -> Result<Self, DbError> {
        create_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Inserts events, ignoring any whose id is already stored.
    ///
    /// Returns the number of rows actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if any insert fails; the whole call is rolled
    /// back in that case.
    pub fn insert_events(&self, events: &[AlertEvent]) -> Result<u64, DbError> {
        let mut seen = HashSet::new();
        let events: Vec<&AlertEvent> = events
            .iter()
            .filter(|e| seen.insert(e.id.as_str()))
            .collect();

        if events.is_empty() {
            return Ok(0);
        }

        crate::with_transaction(&self.conn, |conn| {
            let mut total_inserted = 0u64;

            for chunk in events.chunks(CHUNK_SIZE) {
                let mut sql = format!("INSERT INTO alerts ({EVENT_COLUMNS}) VALUES ");
                for i in 0..chunk.len() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str("(?, ?, ?, ?, ?, ?)");
                }
                sql.push_str(" ON CONFLICT (id) DO NOTHING");

                let mut stmt = conn.prepare(&sql)?;
                let mut param_idx = 1usize;

                for event in chunk {
                    stmt.raw_bind_parameter(param_idx, &event.id)?;
                    stmt.raw_bind_parameter(param_idx + 1, event.timestamp_millis)?;
                    stmt.raw_bind_parameter(param_idx + 2, event.longitude)?;
                    stmt.raw_bind_parameter(param_idx + 3, event.latitude)?;
                    stmt.raw_bind_parameter(param_idx + 4, event.confidence)?;
                    stmt.raw_bind_parameter(param_idx + 5, event.reliability)?;
                    param_idx += 6;
                }

                let rows = stmt.raw_execute()?;
                total_inserted += u64::try_from(rows).unwrap_or(0);
            }

            Ok(total_inserted)
        })
    }

    /// Total number of stored events, with or without coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn record_count(&self) -> Result<u64, DbError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| DbError::Conversion {
            message: format!("negative row count {count}"),
        })
    }

    fn query_events(
        &self,
        sql: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> Result<Vec<AlertEvent>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let events = stmt
            .query_map(params, row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

impl EventSource for EventStore {
    fn max_timestamp(&self) -> Result<Option<i64>, StoreError> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(timestamp_ms) FROM alerts", [], |row| row.get(0))
            .map_err(DbError::from)?;
        Ok(max)
    }

    fn mappable_events_in(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM alerts
             WHERE {MAPPABLE} AND timestamp_ms >= ? AND timestamp_ms < ?
             ORDER BY timestamp_ms, id"
        );
        Ok(self.query_events(&sql, params![range.start_ms, range.end_ms])?)
    }

    fn mappable_events_since(&self, start_ms: i64) -> Result<Vec<AlertEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM alerts
             WHERE {MAPPABLE} AND timestamp_ms >= ?
             ORDER BY timestamp_ms, id"
        );
        Ok(self.query_events(&sql, params![start_ms])?)
    }

    fn count_mappable_in(&self, range: TimeRange) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM alerts
             WHERE {MAPPABLE} AND timestamp_ms >= ? AND timestamp_ms < ?"
        );
        let count: i64 = self
            .conn
            .query_row(&sql, params![range.start_ms, range.end_ms], |row| row.get(0))
            .map_err(DbError::from)?;
        Ok(u64::try_from(count).map_err(|_| DbError::Conversion {
            message: format!("negative row count {count}"),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, ts: i64, lon: Option<f64>, lat: Option<f64>) -> AlertEvent {
        AlertEvent {
            id: id.to_string(),
            timestamp_millis: ts,
            longitude: lon,
            latitude: lat,
            confidence: 1,
            reliability: 6,
        }
    }

    fn store_with(events: &[AlertEvent]) -> EventStore {
        let store = EventStore::open_in_memory().unwrap();
        store.insert_events(events).unwrap();
        store
    }

    #[test]
    fn empty_store_has_no_max_timestamp() {
        let store = EventStore::open_in_memory().unwrap();
        assert_eq!(store.max_timestamp().unwrap(), None);
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let store = store_with(&[event("a", 10, Some(1.0), Some(2.0))]);
        let inserted = store
            .insert_events(&[
                event("a", 99, Some(5.0), Some(5.0)),
                event("b", 20, Some(1.0), Some(2.0)),
            ])
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(store.record_count().unwrap(), 2);
        // The original row is untouched.
        let events = store.mappable_events_since(0).unwrap();
        assert_eq!(events[0].id, "a");
        assert_eq!(events[0].timestamp_millis, 10);
    }

    #[test]
    fn max_timestamp_includes_unmappable_events() {
        let store = store_with(&[
            event("a", 10, Some(1.0), Some(2.0)),
            event("b", 50, None, None),
        ]);
        assert_eq!(store.max_timestamp().unwrap(), Some(50));
    }

    #[test]
    fn range_queries_are_half_open_and_skip_missing_coordinates() {
        let store = store_with(&[
            event("before", 9, Some(1.0), Some(2.0)),
            event("start", 10, Some(1.0), Some(2.0)),
            event("inside", 15, Some(-3.5), Some(4.25)),
            event("no_lat", 16, Some(1.0), None),
            event("end", 20, Some(1.0), Some(2.0)),
        ]);
        let range = TimeRange {
            start_ms: 10,
            end_ms: 20,
        };

        let ids: Vec<String> = store
            .mappable_events_in(range)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["start".to_string(), "inside".to_string()]);
        assert_eq!(store.count_mappable_in(range).unwrap(), 2);
    }

    #[test]
    fn since_query_has_no_upper_bound() {
        let store = store_with(&[
            event("old", 5, Some(1.0), Some(2.0)),
            event("new", 500, Some(1.0), Some(2.0)),
        ]);
        let events = store.mappable_events_since(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "new");
    }

    #[test]
    fn round_trips_all_columns() {
        let original = event("full", 1_700_000_000_123, Some(-77.036_5), Some(38.897_7));
        let store = store_with(std::slice::from_ref(&original));
        let events = store.mappable_events_since(0).unwrap();
        assert_eq!(events, vec![original]);
    }
}
