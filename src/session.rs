//! Authentication session: the persisted bearer token and the logout signal.

use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::db::{Database, StorageError};

/// Key of the persisted token slot.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Durable slot holding the bearer token.
pub trait TokenStore: Send + Sync {
  fn get_token(&self) -> Result<Option<String>, StorageError>;
  fn set_token(&self, token: &str) -> Result<(), StorageError>;
  fn clear_token(&self) -> Result<(), StorageError>;
}

/// Token kept in process memory only.
#[derive(Default)]
pub struct MemoryTokenStore {
  token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_token(token: impl Into<String>) -> Self {
    Self {
      token: Mutex::new(Some(token.into())),
    }
  }
}

impl TokenStore for MemoryTokenStore {
  fn get_token(&self) -> Result<Option<String>, StorageError> {
    Ok(self.token.lock().map_err(|_| StorageError::LockPoisoned)?.clone())
  }

  fn set_token(&self, token: &str) -> Result<(), StorageError> {
    *self.token.lock().map_err(|_| StorageError::LockPoisoned)? = Some(token.to_string());
    Ok(())
  }

  fn clear_token(&self) -> Result<(), StorageError> {
    *self.token.lock().map_err(|_| StorageError::LockPoisoned)? = None;
    Ok(())
  }
}

/// Token persisted in the `kv` table under [`AUTH_TOKEN_KEY`].
pub struct SqliteTokenStore {
  db: Arc<Database>,
}

impl SqliteTokenStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl TokenStore for SqliteTokenStore {
  fn get_token(&self) -> Result<Option<String>, StorageError> {
    let conn = self.db.lock()?;
    let token = conn
      .query_row(
        "SELECT value FROM kv WHERE key = ?",
        params![AUTH_TOKEN_KEY],
        |row| row.get(0),
      )
      .optional()?;
    Ok(token)
  }

  fn set_token(&self, token: &str) -> Result<(), StorageError> {
    let conn = self.db.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
      params![AUTH_TOKEN_KEY, token],
    )?;
    Ok(())
  }

  fn clear_token(&self) -> Result<(), StorageError> {
    let conn = self.db.lock()?;
    conn.execute("DELETE FROM kv WHERE key = ?", params![AUTH_TOKEN_KEY])?;
    Ok(())
  }
}

/// Events the session broadcasts to the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
  /// The token was cleared; listeners should return to the login view.
  Logout,
}

impl AuthEvent {
  /// Name listeners match on.
  pub fn name(&self) -> &'static str {
    match self {
      Self::Logout => "auth:logout",
    }
  }
}

/// Shared authentication state, injected into the request client.
#[derive(Clone)]
pub struct Session {
  tokens: Arc<dyn TokenStore>,
  events: broadcast::Sender<AuthEvent>,
}

impl Session {
  pub fn new(tokens: Arc<dyn TokenStore>) -> Self {
    let (events, _) = broadcast::channel(16);
    Self { tokens, events }
  }

  /// Session with no persisted token.
  pub fn in_memory() -> Self {
    Self::new(Arc::new(MemoryTokenStore::new()))
  }

  /// Current bearer token, if any.
  pub fn token(&self) -> Result<Option<String>, StorageError> {
    self.tokens.get_token()
  }

  pub fn set_token(&self, token: &str) -> Result<(), StorageError> {
    self.tokens.set_token(token)
  }

  /// Register a listener for session events.
  pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
    self.events.subscribe()
  }

  /// Clear the token and emit exactly one [`AuthEvent::Logout`].
  ///
  /// The event is emitted even if clearing the slot fails, so listeners
  /// still leave authenticated views.
  pub fn expire(&self) -> Result<(), StorageError> {
    let cleared = self.tokens.clear_token();
    if let Err(e) = &cleared {
      tracing::error!(error = %e, "failed to clear persisted token");
    }

    // No receivers is fine: nobody is listening yet.
    let _ = self.events.send(AuthEvent::Logout);
    tracing::info!(event = AuthEvent::Logout.name(), "session expired");

    cleared
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_token_round_trip() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = SqliteTokenStore::new(db);

    assert_eq!(store.get_token().unwrap(), None);
    store.set_token("abc").unwrap();
    store.set_token("def").unwrap();
    assert_eq!(store.get_token().unwrap().as_deref(), Some("def"));
    store.clear_token().unwrap();
    assert_eq!(store.get_token().unwrap(), None);
  }

  #[test]
  fn test_sqlite_token_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("casesync.db");

    {
      let db = Arc::new(Database::open(&path).unwrap());
      SqliteTokenStore::new(db).set_token("persisted").unwrap();
    }

    let db = Arc::new(Database::open(&path).unwrap());
    assert_eq!(
      SqliteTokenStore::new(db).get_token().unwrap().as_deref(),
      Some("persisted")
    );
  }

  #[tokio::test]
  async fn test_expire_clears_and_emits_once() {
    let session = Session::new(Arc::new(MemoryTokenStore::with_token("t0k3n")));
    let mut events = session.subscribe();

    session.expire().unwrap();

    assert_eq!(session.token().unwrap(), None);
    assert_eq!(events.recv().await.unwrap(), AuthEvent::Logout);
    assert!(events.try_recv().is_err());
  }

  #[test]
  fn test_logout_event_name() {
    assert_eq!(AuthEvent::Logout.name(), "auth:logout");
  }
}
