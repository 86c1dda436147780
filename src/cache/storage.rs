//! Cache storage trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::CacheEntry;
use crate::db::{from_micros, to_micros, Database, StorageError};

/// Trait for cache storage backends.
pub trait CacheStore: Send + Sync {
  /// Get the entry for a key.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

  /// Insert or replace the entry for its key.
  fn put(&self, entry: &CacheEntry) -> Result<(), StorageError>;

  /// Remove an entry. Returns whether one existed.
  fn delete(&self, key: &str) -> Result<bool, StorageError>;

  /// All entries, oldest first.
  fn list_all(&self) -> Result<Vec<CacheEntry>, StorageError>;

  /// Remove every entry last modified before `cutoff`. Returns the count removed.
  fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Cache store that keeps entries in process memory.
#[derive(Default)]
pub struct MemoryCacheStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>, StorageError> {
    self.entries.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl CacheStore for MemoryCacheStore {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    Ok(self.entries()?.get(key).cloned())
  }

  fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
    self.entries()?.insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    Ok(self.entries()?.remove(key).is_some())
  }

  fn list_all(&self) -> Result<Vec<CacheEntry>, StorageError> {
    let mut all: Vec<CacheEntry> = self.entries()?.values().cloned().collect();
    all.sort_by_key(|e| e.last_modified);
    Ok(all)
  }

  fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    let mut entries = self.entries()?;
    let before = entries.len();
    entries.retain(|_, e| e.last_modified >= cutoff);
    Ok(before - entries.len())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStore {
  db: Arc<Database>,
}

impl SqliteCacheStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, Vec<u8>, String, i64)> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_entry(raw: (String, Vec<u8>, String, i64)) -> Result<CacheEntry, StorageError> {
  let (key, value, category, last_modified) = raw;
  Ok(CacheEntry {
    key,
    value: serde_json::from_slice(&value)?,
    last_modified: from_micros(last_modified)?,
    category,
  })
}

impl CacheStore for SqliteCacheStore {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    let conn = self.db.lock()?;
    let raw = conn
      .query_row(
        "SELECT key, value, category, last_modified FROM cache_entries WHERE key = ?",
        params![key],
        row_to_entry,
      )
      .optional()?;

    raw.map(decode_entry).transpose()
  }

  fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
    let value = serde_json::to_vec(&entry.value)?;
    let conn = self.db.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (key, value, category, last_modified)
       VALUES (?, ?, ?, ?)",
      params![entry.key, value, entry.category, to_micros(entry.last_modified)],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.db.lock()?;
    let rows = conn.execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
    Ok(rows > 0)
  }

  fn list_all(&self) -> Result<Vec<CacheEntry>, StorageError> {
    let conn = self.db.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, value, category, last_modified FROM cache_entries
       ORDER BY last_modified",
    )?;

    let rows = stmt.query_map([], row_to_entry)?;
    let mut entries = Vec::new();
    for row in rows {
      entries.push(decode_entry(row?)?);
    }
    Ok(entries)
  }

  fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    let conn = self.db.lock()?;
    let rows = conn.execute(
      "DELETE FROM cache_entries WHERE last_modified < ?",
      params![to_micros(cutoff)],
    )?;
    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn stores() -> Vec<Box<dyn CacheStore>> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    vec![
      Box::new(MemoryCacheStore::new()),
      Box::new(SqliteCacheStore::new(db)),
    ]
  }

  #[test]
  fn test_missing_key_is_none() {
    for store in stores() {
      assert!(store.get("cases:nope").unwrap().is_none());
    }
  }

  #[test]
  fn test_put_overwrites_existing_key() {
    for store in stores() {
      store
        .put(&CacheEntry::new("cases:x1", json!({"foo": 1}), "cases"))
        .unwrap();
      store
        .put(&CacheEntry::new("cases:x1", json!({"foo": 2}), "cases"))
        .unwrap();

      let all = store.list_all().unwrap();
      assert_eq!(all.len(), 1);
      assert_eq!(all[0].value, json!({"foo": 2}));
    }
  }

  #[test]
  fn test_delete_reports_presence() {
    for store in stores() {
      store
        .put(&CacheEntry::new("notes:1", json!([]), "notes"))
        .unwrap();
      assert!(store.delete("notes:1").unwrap());
      assert!(!store.delete("notes:1").unwrap());
    }
  }

  #[test]
  fn test_prune_removes_only_old_entries() {
    for store in stores() {
      let mut old = CacheEntry::new("old", json!(1), "misc");
      old.last_modified = Utc::now() - Duration::days(10);
      store.put(&old).unwrap();
      store.put(&CacheEntry::new("new", json!(2), "misc")).unwrap();

      let removed = store.prune_before(Utc::now() - Duration::days(7)).unwrap();
      assert_eq!(removed, 1);
      assert!(store.get("old").unwrap().is_none());
      assert!(store.get("new").unwrap().is_some());
    }
  }

  #[test]
  fn test_sqlite_round_trips_metadata() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = SqliteCacheStore::new(db);
    let entry = CacheEntry::new("transactions:t9", json!({"amount": 120.5}), "transactions");
    store.put(&entry).unwrap();

    let loaded = store.get("transactions:t9").unwrap().unwrap();
    assert_eq!(loaded.category, "transactions");
    assert_eq!(
      loaded.last_modified.timestamp_micros(),
      entry.last_modified.timestamp_micros()
    );
  }
}
