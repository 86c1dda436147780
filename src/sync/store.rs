//! Durable storage for pending operations.

use rusqlite::{params, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

use super::operation::PendingOperation;
use crate::db::{from_micros, to_micros, Database, StorageError};

/// Storage capability for the sync queue.
pub trait QueueStore: Send + Sync {
  /// Insert an operation, or replace the stored copy with the same id.
  /// Replacing keeps the operation's place in the queue.
  fn put(&self, op: &PendingOperation) -> Result<(), StorageError>;

  fn get(&self, id: &str) -> Result<Option<PendingOperation>, StorageError>;

  /// Remove an operation. Returns whether it was present.
  fn delete(&self, id: &str) -> Result<bool, StorageError>;

  /// All queued operations in `enqueued_at` order, ties in insertion order.
  fn list_all(&self) -> Result<Vec<PendingOperation>, StorageError>;

  fn count(&self) -> Result<usize, StorageError>;
}

/// Queue kept in process memory.
#[derive(Default)]
pub struct MemoryQueueStore {
  ops: Mutex<Vec<PendingOperation>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn ops(&self) -> Result<std::sync::MutexGuard<'_, Vec<PendingOperation>>, StorageError> {
    self.ops.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl QueueStore for MemoryQueueStore {
  fn put(&self, op: &PendingOperation) -> Result<(), StorageError> {
    let mut ops = self.ops()?;
    match ops.iter_mut().find(|existing| existing.id == op.id) {
      Some(existing) => *existing = op.clone(),
      None => ops.push(op.clone()),
    }
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<PendingOperation>, StorageError> {
    Ok(self.ops()?.iter().find(|op| op.id == id).cloned())
  }

  fn delete(&self, id: &str) -> Result<bool, StorageError> {
    let mut ops = self.ops()?;
    let before = ops.len();
    ops.retain(|op| op.id != id);
    Ok(ops.len() < before)
  }

  fn list_all(&self) -> Result<Vec<PendingOperation>, StorageError> {
    let mut ops = self.ops()?.clone();
    // Stable sort keeps insertion order for equal timestamps.
    ops.sort_by_key(|op| op.enqueued_at);
    Ok(ops)
  }

  fn count(&self) -> Result<usize, StorageError> {
    Ok(self.ops()?.len())
  }
}

/// Queue persisted in the `sync_queue` table.
pub struct SqliteQueueStore {
  db: Arc<Database>,
}

impl SqliteQueueStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const SELECT_COLUMNS: &str = "SELECT id, resource_kind, operation_kind, payload, enqueued_at,
                                     attempt_count, last_error
                              FROM sync_queue";

struct RawOperation {
  id: String,
  resource_kind: String,
  operation_kind: String,
  payload: Vec<u8>,
  enqueued_at: i64,
  attempt_count: u32,
  last_error: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
  Ok(RawOperation {
    id: row.get(0)?,
    resource_kind: row.get(1)?,
    operation_kind: row.get(2)?,
    payload: row.get(3)?,
    enqueued_at: row.get(4)?,
    attempt_count: row.get(5)?,
    last_error: row.get(6)?,
  })
}

fn decode(raw: RawOperation) -> Result<PendingOperation, StorageError> {
  let corrupt = |e| StorageError::Corrupt(format!("operation {}: {}", raw.id, e));
  Ok(PendingOperation {
    resource_kind: raw.resource_kind.parse().map_err(corrupt)?,
    operation_kind: raw.operation_kind.parse().map_err(corrupt)?,
    payload: serde_json::from_slice(&raw.payload)?,
    enqueued_at: from_micros(raw.enqueued_at)?,
    attempt_count: raw.attempt_count,
    last_error: raw.last_error,
    id: raw.id,
  })
}

impl QueueStore for SqliteQueueStore {
  fn put(&self, op: &PendingOperation) -> Result<(), StorageError> {
    let payload = serde_json::to_vec(&op.payload)?;
    let conn = self.db.lock()?;
    conn.execute(
      "INSERT INTO sync_queue
         (id, resource_kind, operation_kind, payload, enqueued_at, attempt_count, last_error)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
       ON CONFLICT(id) DO UPDATE SET
         resource_kind = excluded.resource_kind,
         operation_kind = excluded.operation_kind,
         payload = excluded.payload,
         enqueued_at = excluded.enqueued_at,
         attempt_count = excluded.attempt_count,
         last_error = excluded.last_error",
      params![
        op.id,
        op.resource_kind.as_str(),
        op.operation_kind.as_str(),
        payload,
        to_micros(op.enqueued_at),
        op.attempt_count,
        op.last_error,
      ],
    )?;
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<PendingOperation>, StorageError> {
    let conn = self.db.lock()?;
    let raw = conn
      .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?"), params![id], read_row)
      .optional()?;
    raw.map(decode).transpose()
  }

  fn delete(&self, id: &str) -> Result<bool, StorageError> {
    let conn = self.db.lock()?;
    let rows = conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
    Ok(rows > 0)
  }

  fn list_all(&self) -> Result<Vec<PendingOperation>, StorageError> {
    let conn = self.db.lock()?;
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY enqueued_at ASC, seq ASC"))?;

    let rows = stmt.query_map([], read_row)?;
    let mut ops = Vec::new();
    for row in rows {
      ops.push(decode(row?)?);
    }
    Ok(ops)
  }

  fn count(&self) -> Result<usize, StorageError> {
    let conn = self.db.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}
