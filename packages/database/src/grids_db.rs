//! Generated grid storage.
//!
//! Each run writes into `*_next` staging tables. [`GridSink::finish_rebuild`]
//! copies the staged rows over the live tables inside one transaction, so a
//! reader of `density_grid`, `diversity_grid` or `metadata` always sees one
//! complete generation. An aborted run leaves the previous generation in
//! place.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr as _;

use alert_map_grid::GridSink;
use alert_map_grid_models::{CellKey, DensityCell, DiversityCell, MetadataKey, StoreError};
use duckdb::types::Value;
use duckdb::{Connection, params};

use crate::{DbError, from_i32, to_i32};

/// Maximum rows bound into one INSERT statement.
const CHUNK_SIZE: usize = 2_000;

const DENSITY_COLUMNS: &[&str] = &[
    "time_window_id",
    "level",
    "lon_scaled",
    "lat_scaled",
    "density",
];

const DIVERSITY_COLUMNS: &[&str] = &[
    "radius_group_id",
    "level",
    "lon_scaled",
    "lat_scaled",
    "score",
];

/// Live tables paired with their staging counterparts, in publish order.
const TABLES: &[(&str, &str)] = &[
    ("density_grid", "density_grid_next"),
    ("diversity_grid", "diversity_grid_next"),
    ("metadata", "metadata_next"),
];

fn table_ddl(name: &str) -> String {
    if name.starts_with("density_grid") {
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                time_window_id INTEGER NOT NULL,
                level INTEGER NOT NULL,
                lon_scaled BIGINT NOT NULL,
                lat_scaled BIGINT NOT NULL,
                density INTEGER NOT NULL,
                PRIMARY KEY (time_window_id, level, lon_scaled, lat_scaled)
            );"
        )
    } else if name.starts_with("diversity_grid") {
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                radius_group_id INTEGER NOT NULL,
                level INTEGER NOT NULL,
                lon_scaled BIGINT NOT NULL,
                lat_scaled BIGINT NOT NULL,
                score INTEGER NOT NULL,
                PRIMARY KEY (radius_group_id, level, lon_scaled, lat_scaled)
            );"
        )
    } else {
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                key TEXT NOT NULL PRIMARY KEY,
                value TEXT NOT NULL
            );"
        )
    }
}

/// Inserts `rows` into `table` with chunked multi-row VALUES statements.
///
/// Must run inside a transaction for the batch to be atomic.
fn insert_rows(
    conn: &Connection,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
) -> Result<(), DbError> {
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));

    for chunk in rows.chunks(CHUNK_SIZE) {
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            vec![placeholders.as_str(); chunk.len()].join(", ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut param_idx = 1usize;
        for row in chunk {
            for value in row {
                stmt.raw_bind_parameter(param_idx, value)?;
                param_idx += 1;
            }
        }
        stmt.raw_execute()?;
    }

    Ok(())
}

fn density_row(cell: &DensityCell) -> Result<Vec<Value>, DbError> {
    Ok(vec![
        Value::Int(to_i32(cell.time_window_id, "time window id")?),
        Value::Int(i32::from(cell.level)),
        Value::BigInt(cell.cell.lon),
        Value::BigInt(cell.cell.lat),
        Value::Int(i32::from(cell.density)),
    ])
}

fn diversity_row(cell: &DiversityCell) -> Result<Vec<Value>, DbError> {
    Ok(vec![
        Value::Int(to_i32(cell.radius_group_id, "radius group id")?),
        Value::Int(i32::from(cell.level)),
        Value::BigInt(cell.cell.lon),
        Value::BigInt(cell.cell.lat),
        Value::Int(to_i32(cell.score, "score")?),
    ])
}

/// Row count for one `(id, level)` pair of a grid table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelCount {
    /// Time window id or radius group id, depending on the table.
    pub id: u32,
    pub level: u8,
    pub rows: u64,
}

/// The grids database.
pub struct GridStore {
    conn: Connection,
    rebuilding: bool,
}

impl GridStore {
    /// Opens (or creates) the grids database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection, or schema creation
    /// fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        crate::paths::ensure_parent(path)?;
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a throwaway in-memory grids database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection, creating the live tables if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if schema creation fails.
    pub fn from_connection(conn: Connection) -> Result<Self, DbError> {
        for (live, _) in TABLES {
            conn.execute_batch(&table_ddl(live))?;
        }
        Ok(Self {
            conn,
            rebuilding: false,
        })
    }

    fn ensure_rebuilding(&self) -> Result<(), DbError> {
        if self.rebuilding {
            Ok(())
        } else {
            Err(DbError::NoRebuild)
        }
    }

    fn drop_staging(&self) -> Result<(), DbError> {
        for (_, staging) in TABLES {
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {staging};"))?;
        }
        Ok(())
    }

    /// Published density rows for one `(window, level)`, ordered by cell.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a stored value is out of
    /// range.
    pub fn density_cells(
        &self,
        time_window_id: u32,
        level: u8,
    ) -> Result<Vec<DensityCell>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT lon_scaled, lat_scaled, density FROM density_grid
             WHERE time_window_id = ? AND level = ?
             ORDER BY lon_scaled, lat_scaled",
        )?;
        let raw = stmt
            .query_map(
                params![to_i32(time_window_id, "time window id")?, i32::from(level)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i32>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(lon, lat, density)| {
                Ok(DensityCell {
                    time_window_id,
                    level,
                    cell: CellKey::new(lon, lat),
                    density: from_i32(density, "density")?,
                })
            })
            .collect()
    }

    fn query_diversity(
        &self,
        table: &str,
        radius_group_id: u32,
        level: u8,
    ) -> Result<Vec<DiversityCell>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT lon_scaled, lat_scaled, score FROM {table}
             WHERE radius_group_id = ? AND level = ?
             ORDER BY lon_scaled, lat_scaled"
        ))?;
        let raw = stmt
            .query_map(
                params![to_i32(radius_group_id, "radius group id")?, i32::from(level)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i32>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(lon, lat, score)| {
                Ok(DiversityCell {
                    radius_group_id,
                    level,
                    cell: CellKey::new(lon, lat),
                    score: from_i32(score, "score")?,
                })
            })
            .collect()
    }

    /// Published diversity rows for one `(radius group, level)`, ordered by
    /// cell.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a stored value is out of
    /// range.
    pub fn diversity_cells(
        &self,
        radius_group_id: u32,
        level: u8,
    ) -> Result<Vec<DiversityCell>, DbError> {
        self.query_diversity("diversity_grid", radius_group_id, level)
    }

    /// Published metadata entries.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a key is not recognised.
    pub fn metadata(&self) -> Result<BTreeMap<MetadataKey, String>, DbError> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM metadata")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(key, value)| {
                let key = MetadataKey::from_str(&key).map_err(|_| DbError::Conversion {
                    message: format!("unknown metadata key '{key}'"),
                })?;
                Ok((key, value))
            })
            .collect()
    }

    /// Published row counts per `(time window, level)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn density_level_counts(&self) -> Result<Vec<LevelCount>, DbError> {
        self.level_counts("density_grid", "time_window_id")
    }

    /// Published row counts per `(radius group, level)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn diversity_level_counts(&self) -> Result<Vec<LevelCount>, DbError> {
        self.level_counts("diversity_grid", "radius_group_id")
    }

    fn level_counts(&self, table: &str, id_column: &str) -> Result<Vec<LevelCount>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {id_column}, level, COUNT(*) FROM {table}
             GROUP BY {id_column}, level
             ORDER BY {id_column}, level DESC"
        ))?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, level, rows)| {
                Ok(LevelCount {
                    id: from_i32(id, id_column)?,
                    level: from_i32(level, "level")?,
                    rows: u64::try_from(rows).map_err(|_| DbError::Conversion {
                        message: format!("negative row count {rows}"),
                    })?,
                })
            })
            .collect()
    }
}

impl GridSink for GridStore {
    fn begin_rebuild(&mut self) -> Result<(), StoreError> {
        self.drop_staging()?;
        for (_, staging) in TABLES {
            self.conn
                .execute_batch(&table_ddl(staging))
                .map_err(DbError::from)?;
        }
        self.rebuilding = true;
        log::debug!("Created grid staging tables");
        Ok(())
    }

    fn write_density(&mut self, cells: &[DensityCell]) -> Result<(), StoreError> {
        self.ensure_rebuilding()?;
        let rows = cells.iter().map(density_row).collect::<Result<Vec<_>, _>>()?;
        crate::with_transaction(&self.conn, |conn| {
            insert_rows(conn, "density_grid_next", DENSITY_COLUMNS, &rows)
        })?;
        Ok(())
    }

    fn write_diversity(&mut self, cells: &[DiversityCell]) -> Result<(), StoreError> {
        self.ensure_rebuilding()?;
        let rows = cells
            .iter()
            .map(diversity_row)
            .collect::<Result<Vec<_>, _>>()?;
        crate::with_transaction(&self.conn, |conn| {
            insert_rows(conn, "diversity_grid_next", DIVERSITY_COLUMNS, &rows)
        })?;
        Ok(())
    }

    fn read_diversity(
        &self,
        radius_group_id: u32,
        level: u8,
    ) -> Result<Vec<DiversityCell>, StoreError> {
        self.ensure_rebuilding()?;
        Ok(self.query_diversity("diversity_grid_next", radius_group_id, level)?)
    }

    fn write_metadata(&mut self, entries: &[(MetadataKey, String)]) -> Result<(), StoreError> {
        self.ensure_rebuilding()?;
        let rows: Vec<Vec<Value>> = entries
            .iter()
            .map(|(key, value)| {
                vec![
                    Value::Text(key.as_ref().to_string()),
                    Value::Text(value.clone()),
                ]
            })
            .collect();

        crate::with_transaction(&self.conn, |conn| {
            conn.execute_batch("DELETE FROM metadata_next")?;
            insert_rows(conn, "metadata_next", &["key", "value"], &rows)
        })?;
        Ok(())
    }

    fn finish_rebuild(&mut self) -> Result<(), StoreError> {
        self.ensure_rebuilding()?;

        crate::with_transaction(&self.conn, |conn| {
            for (live, staging) in TABLES {
                conn.execute_batch(&format!(
                    "DELETE FROM {live}; INSERT INTO {live} SELECT * FROM {staging};"
                ))?;
            }
            Ok(())
        })?;
        self.rebuilding = false;
        log::info!("Published rebuilt grid tables");

        if let Err(e) = self.drop_staging() {
            log::warn!("Failed to drop grid staging tables: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn density(window: u32, level: u8, lon: i64, lat: i64, value: u8) -> DensityCell {
        DensityCell {
            time_window_id: window,
            level,
            cell: CellKey::new(lon, lat),
            density: value,
        }
    }

    fn diversity(group: u32, level: u8, lon: i64, lat: i64, score: u32) -> DiversityCell {
        DiversityCell {
            radius_group_id: group,
            level,
            cell: CellKey::new(lon, lat),
            score,
        }
    }

    #[test]
    fn writes_require_a_rebuild() {
        let mut store = GridStore::open_in_memory().unwrap();
        assert!(store.write_density(&[density(0, 5, 1, 1, 9)]).is_err());
        assert!(store.read_diversity(0, 5).is_err());
        assert!(store.finish_rebuild().is_err());
    }

    #[test]
    fn staged_rows_are_invisible_until_published() {
        let mut store = GridStore::open_in_memory().unwrap();
        store.begin_rebuild().unwrap();
        store.write_density(&[density(0, 5, -7, 3, 255)]).unwrap();
        store
            .write_diversity(&[diversity(1, 4, 10, -20, 3)])
            .unwrap();

        assert!(store.density_cells(0, 5).unwrap().is_empty());
        assert_eq!(
            store.read_diversity(1, 4).unwrap(),
            vec![diversity(1, 4, 10, -20, 3)]
        );

        store.finish_rebuild().unwrap();

        assert_eq!(
            store.density_cells(0, 5).unwrap(),
            vec![density(0, 5, -7, 3, 255)]
        );
        assert_eq!(
            store.diversity_cells(1, 4).unwrap(),
            vec![diversity(1, 4, 10, -20, 3)]
        );
    }

    #[test]
    fn publish_replaces_previous_generation() {
        let mut store = GridStore::open_in_memory().unwrap();
        store.begin_rebuild().unwrap();
        store
            .write_density(&[density(0, 5, 1, 1, 10), density(0, 5, 2, 2, 20)])
            .unwrap();
        store
            .write_metadata(&[(MetadataKey::TotalAlerts, "2".to_string())])
            .unwrap();
        store.finish_rebuild().unwrap();

        store.begin_rebuild().unwrap();
        store.write_density(&[density(0, 5, 3, 3, 30)]).unwrap();
        // Still the first generation while the second is being built.
        assert_eq!(store.density_cells(0, 5).unwrap().len(), 2);
        store
            .write_metadata(&[(MetadataKey::TotalAlerts, "1".to_string())])
            .unwrap();
        store.finish_rebuild().unwrap();

        assert_eq!(
            store.density_cells(0, 5).unwrap(),
            vec![density(0, 5, 3, 3, 30)]
        );
        assert_eq!(
            store.metadata().unwrap().get(&MetadataKey::TotalAlerts),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn abandoned_rebuild_keeps_published_rows() {
        let mut store = GridStore::open_in_memory().unwrap();
        store.begin_rebuild().unwrap();
        store.write_density(&[density(0, 5, 1, 1, 10)]).unwrap();
        store.finish_rebuild().unwrap();

        store.begin_rebuild().unwrap();
        store.write_density(&[density(0, 5, 9, 9, 90)]).unwrap();
        // A fresh rebuild discards the abandoned staging rows.
        store.begin_rebuild().unwrap();
        store.finish_rebuild().unwrap();

        assert!(store.density_cells(0, 5).unwrap().is_empty());
    }

    #[test]
    fn duplicate_key_rejects_the_whole_batch() {
        let mut store = GridStore::open_in_memory().unwrap();
        store.begin_rebuild().unwrap();
        let result = store.write_diversity(&[
            diversity(0, 5, 1, 1, 1),
            diversity(0, 5, 2, 2, 1),
            diversity(0, 5, 1, 1, 2),
        ]);
        assert!(result.is_err());
        assert!(store.read_diversity(0, 5).unwrap().is_empty());

        // The store stays usable for later batches.
        store.write_diversity(&[diversity(0, 5, 1, 1, 1)]).unwrap();
        assert_eq!(store.read_diversity(0, 5).unwrap().len(), 1);
    }

    #[test]
    fn level_counts_group_by_id_and_level() {
        let mut store = GridStore::open_in_memory().unwrap();
        store.begin_rebuild().unwrap();
        store
            .write_diversity(&[diversity(0, 5, 1, 1, 1), diversity(0, 5, 2, 1, 2)])
            .unwrap();
        store.write_diversity(&[diversity(0, 4, 0, 0, 2)]).unwrap();
        store.write_diversity(&[diversity(2, 5, 1, 1, 1)]).unwrap();
        store.finish_rebuild().unwrap();

        assert_eq!(
            store.diversity_level_counts().unwrap(),
            vec![
                LevelCount {
                    id: 0,
                    level: 5,
                    rows: 2
                },
                LevelCount {
                    id: 0,
                    level: 4,
                    rows: 1
                },
                LevelCount {
                    id: 2,
                    level: 5,
                    rows: 1
                },
            ]
        );
        assert!(store.density_level_counts().unwrap().is_empty());
    }

    #[test]
    fn metadata_round_trips_every_key() {
        let mut store = GridStore::open_in_memory().unwrap();
        store.begin_rebuild().unwrap();
        let entries: Vec<(MetadataKey, String)> = MetadataKey::ALL
            .iter()
            .enumerate()
            .map(|(i, key)| (*key, i.to_string()))
            .collect();
        store.write_metadata(&entries).unwrap();
        store.finish_rebuild().unwrap();

        let stored = store.metadata().unwrap();
        assert_eq!(stored.len(), MetadataKey::ALL.len());
        assert_eq!(stored.get(&MetadataKey::CenterLat), Some(&"2".to_string()));
    }
}
