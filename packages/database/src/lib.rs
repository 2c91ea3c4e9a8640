#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `DuckDB` storage for the alert map.
//!
//! Two database files are involved:
//!
//! - the events database (`data/alerts.duckdb`), owned by ingestion and only
//!   read by generation, see [`events_db`];
//! - the grids database (`data/generated/grids.duckdb`), fully rebuilt by
//!   every generation run and read by the map server, see [`grids_db`].

pub mod events_db;
pub mod grids_db;
pub mod paths;

use alert_map_grid_models::StoreError;
use duckdb::Connection;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` query or connection error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// Filesystem error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A staging write or publish was attempted outside a rebuild.
    #[error("No grid rebuild in progress")]
    NoRebuild,

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conversion { message } => Self::InvalidRow { message },
            other => Self::Backend(Box::new(other)),
        }
    }
}

/// Runs `f` inside a transaction, committing on success and rolling back
/// on any error.
///
/// # Errors
///
/// Returns whatever `f` returns, or [`DbError`] if the transaction cannot be
/// started or committed.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, DbError>,
) -> Result<T, DbError> {
    conn.execute_batch("BEGIN TRANSACTION")?;

    let result = f(conn).and_then(|value| {
        conn.execute_batch("COMMIT")?;
        Ok(value)
    });

    if result.is_err()
        && let Err(e) = conn.execute_batch("ROLLBACK")
    {
        log::warn!("Rollback failed: {e}");
    }

    result
}

fn to_i32(value: u32, what: &str) -> Result<i32, DbError> {
    i32::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("{what} {value} does not fit in INTEGER"),
    })
}

fn from_i32<T: TryFrom<i32>>(value: i32, what: &str) -> Result<T, DbError> {
    T::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("stored {what} {value} is out of range"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_rolls_back_on_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();

        let result: Result<(), DbError> = with_transaction(&conn, |c| {
            c.execute("INSERT INTO t VALUES (1)", [])?;
            Err(DbError::Conversion {
                message: "boom".to_string(),
            })
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn transaction_commits_on_success() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();

        with_transaction(&conn, |c| {
            c.execute("INSERT INTO t VALUES (1), (2)", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn conversion_errors_become_invalid_rows() {
        let err: StoreError = DbError::Conversion {
            message: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, StoreError::InvalidRow { .. }));
    }

    #[test]
    fn integer_conversions_are_checked() {
        assert_eq!(to_i32(7, "level").unwrap(), 7);
        assert!(to_i32(u32::MAX, "level").is_err());
        assert_eq!(from_i32::<u8>(200, "density").unwrap(), 200);
        assert!(from_i32::<u8>(300, "density").is_err());
        assert!(from_i32::<u32>(-1, "score").is_err());
    }
}
