pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Failure in the durable storage layer.
///
/// Always terminal to the call that triggered it; nothing in this crate retries
/// a storage fault.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to (de)serialize stored value: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("storage lock poisoned")]
  LockPoisoned,

  #[error("failed to prepare storage location {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("corrupt stored row: {0}")]
  Corrupt(String),
}

/// Shared SQLite connection holding the sync queue, the cache and the
/// key/value slots.
///
/// Access is serialized through a mutex; every store does its
/// read-modify-write under one lock acquisition.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let conn = Connection::open(path)?;
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened database");
    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let db = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("casesync").join("casesync.db"))
  }

  fn run_migrations(&self) -> Result<(), StorageError> {
    self.lock()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Lock the connection for a serialized sequence of statements.
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

/// Timestamps are stored as microseconds since the Unix epoch so that
/// ordering on the column matches ordering in time.
pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
  at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>, StorageError> {
  DateTime::from_timestamp_micros(micros)
    .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {micros}")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("casesync.db");

    let db = Database::open(&path).unwrap();
    assert!(path.exists());

    let count: i64 = db
      .lock()
      .unwrap()
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 0);
  }

  #[test]
  fn test_migrations_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("casesync.db");

    drop(Database::open(&path).unwrap());
    assert!(Database::open(&path).is_ok());
  }
}
