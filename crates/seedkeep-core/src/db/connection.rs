//! Database connection management

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA: &str = include_str!("../../../../migrations/001_initial.sql");

/// Get the database path
pub fn get_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("seedkeep");

    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("seedkeep.db")
}

/// Initialize the database at the default location
pub fn init_database() -> Result<Database> {
    Database::open(get_db_path())
}

/// Database wrapper with thread-safe connection
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Initializing database at: {:?}", path);

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("SQLite journal mode: {}", mode);
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Run migrations
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a function with the database connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| {
            Error::Database(format!("Failed to lock database: {}", e))
        })?;
        f(&conn).map_err(Into::into)
    }

    /// Execute a function with mutable database connection
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| {
            Error::Database(format!("Failed to lock database: {}", e))
        })?;
        f(&mut conn).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_applies_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seedkeep.db");

        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES ('k', '\"v\"')",
                [],
            )
        })
        .unwrap();
        drop(db);

        // Reopening must not wipe existing rows.
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }
}
