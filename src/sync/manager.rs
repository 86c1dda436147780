//! Offline mutation queue: enqueue while offline, replay once back online.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;

use super::connectivity::Connectivity;
use super::error::SyncError;
use super::operation::{NewOperation, PendingOperation, Route};
use super::store::QueueStore;
use crate::api::{ApiClient, ApiError};
use crate::cache::{request_key, CacheEntry, CacheLayer};
use crate::db::StorageError;

/// Failed replays after which an operation is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Drop messages kept in `sync_errors`; the oldest go first.
pub const MAX_SYNC_ERRORS: usize = 100;

/// Snapshot of the queue for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
  pub is_online: bool,
  pub is_syncing: bool,
  pub pending_items: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
  pub sync_errors: Vec<String>,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
  /// Replayed and removed
  pub succeeded: usize,
  /// Failed, still queued for a later pass
  pub retrying: usize,
  /// Ids removed after reaching the attempt ceiling
  pub dropped: Vec<String>,
  /// The backend rejected the session; the remaining operations were left
  /// untouched for after the next login
  pub halted: bool,
}

/// Why `process_sync_queue` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  InProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncPass {
  Skipped(SkipReason),
  Completed(SyncReport),
}

/// Result of a mutation submitted through the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// The backend accepted the call; carries its response body.
  Completed(Value),
  /// The backend was unreachable; the operation waits in the queue.
  Queued(PendingOperation),
}

/// Holds the in-progress flag for the life of one replay pass.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Makes mutations survive connectivity loss and serves cached reads while
/// offline.
pub struct OfflineSync {
  client: ApiClient,
  queue: Arc<dyn QueueStore>,
  cache: CacheLayer,
  connectivity: Connectivity,
  max_attempts: u32,
  syncing: AtomicBool,
  last_sync: Mutex<Option<DateTime<Utc>>>,
  errors: Mutex<Vec<String>>,
}

impl OfflineSync {
  pub fn new(
    client: ApiClient,
    queue: Arc<dyn QueueStore>,
    cache: CacheLayer,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      client,
      queue,
      cache,
      connectivity,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      syncing: AtomicBool::new(false),
      last_sync: Mutex::new(None),
      errors: Mutex::new(Vec::new()),
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn client(&self) -> &ApiClient {
    &self.client
  }

  /// Durably queue a mutation for later replay.
  ///
  /// Returns once the operation is stored, not once it is replayed.
  pub fn queue_for_sync(&self, op: NewOperation) -> Result<PendingOperation, SyncError> {
    op.validate()?;

    let pending = PendingOperation::from_new(op);
    self.queue.put(&pending)?;

    tracing::info!(
      id = %pending.id,
      resource = %pending.resource_kind,
      operation = %pending.operation_kind,
      "queued operation for sync"
    );
    Ok(pending)
  }

  /// Replay every queued operation in order.
  ///
  /// Does nothing while offline or while another pass is running. Replay
  /// failures are counted against the operation, never returned; only
  /// storage faults are.
  pub async fn process_sync_queue(&self) -> Result<SyncPass, SyncError> {
    if !self.connectivity.is_online() {
      tracing::debug!("offline, not processing sync queue");
      return Ok(SyncPass::Skipped(SkipReason::Offline));
    }

    let Some(_in_flight) = InFlight::acquire(&self.syncing) else {
      tracing::debug!("sync already in progress");
      return Ok(SyncPass::Skipped(SkipReason::InProgress));
    };

    let pending = self.queue.list_all()?;
    tracing::info!(count = pending.len(), "processing sync queue");

    let mut report = SyncReport::default();
    for mut op in pending {
      match self.replay(&op).await {
        Err(SyncError::Api(ApiError::Unauthorized)) => {
          // Neither this nor the remaining operations are charged an attempt.
          tracing::warn!(id = %op.id, "session rejected, stopping sync pass");
          report.halted = true;
          break;
        }
        Ok(()) => {
          self.queue.delete(&op.id)?;
          report.succeeded += 1;
          tracing::debug!(id = %op.id, "replayed operation");
        }
        Err(e) => {
          op.attempt_count += 1;
          op.last_error = Some(e.to_string());

          if op.attempt_count >= self.max_attempts {
            self.queue.delete(&op.id)?;
            let message = format!(
              "Failed to sync {} after {} attempts: {}",
              op.describe(),
              op.attempt_count,
              e
            );
            tracing::error!(id = %op.id, attempts = op.attempt_count, error = %e, "dropping operation");
            self.record_error(message);
            report.dropped.push(op.id);
          } else {
            self.queue.put(&op)?;
            tracing::warn!(id = %op.id, attempts = op.attempt_count, error = %e, "replay failed");
            report.retrying += 1;
          }
        }
      }
    }

    *lock(&self.last_sync) = Some(Utc::now());
    tracing::info!(
      succeeded = report.succeeded,
      retrying = report.retrying,
      dropped = report.dropped.len(),
      halted = report.halted,
      "sync pass complete"
    );
    Ok(SyncPass::Completed(report))
  }

  fn record_error(&self, message: String) {
    let mut errors = lock(&self.errors);
    errors.push(message);
    if errors.len() > MAX_SYNC_ERRORS {
      let excess = errors.len() - MAX_SYNC_ERRORS;
      errors.drain(..excess);
    }
  }

  /// One attempt; the queue owns retry across passes.
  async fn replay(&self, op: &PendingOperation) -> Result<(), SyncError> {
    let route = op.route()?;
    self.send(&route, true).await?;
    Ok(())
  }

  async fn send(&self, route: &Route, single_attempt: bool) -> Result<Value, ApiError> {
    let options = if single_attempt {
      route.options().skip_retry()
    } else {
      route.options()
    };
    self.client.request(&route.endpoint, options).await
  }

  /// Submit a mutation, queuing it if the backend cannot be reached.
  pub async fn mutate(&self, op: NewOperation) -> Result<MutationOutcome, SyncError> {
    let route = op.route()?;

    if !self.connectivity.is_online() {
      return self.queue_for_sync(op).map(MutationOutcome::Queued);
    }

    match self.send(&route, false).await {
      Ok(body) => Ok(MutationOutcome::Completed(body)),
      Err(e) if e.is_connectivity() => {
        tracing::warn!(error = %e, endpoint = %route.endpoint, "backend unreachable, queuing mutation");
        self.queue_for_sync(op).map(MutationOutcome::Queued)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Run a read, falling back to the cached copy under `key` if it fails
  /// while offline.
  pub async fn query<T, F, Fut>(&self, key: &str, category: &str, fetch: F) -> Result<T, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let online = self.connectivity.is_online();
    let result = self.cache.fetch(key, category, online, fetch).await?;
    Ok(result.data)
  }

  /// GET an endpoint with cache fallback. The key defaults to one derived
  /// from the endpoint.
  pub async fn query_endpoint<T>(
    &self,
    endpoint: &str,
    key: Option<&str>,
    category: &str,
  ) -> Result<T, ApiError>
  where
    T: Serialize + DeserializeOwned,
  {
    let key = key.map_or_else(|| request_key(endpoint), str::to_string);
    self
      .query(&key, category, || self.client.get::<T>(endpoint))
      .await
  }

  pub fn cache_data(&self, key: &str, value: Value, category: &str) -> Result<(), StorageError> {
    self.cache.put(key, value, category)
  }

  /// Cached entry for `key`, or `None` if there is none.
  pub fn get_cached_data(&self, key: &str) -> Option<CacheEntry> {
    self.cache.get(key)
  }

  /// Drop cache entries older than the retention window.
  pub fn prune_cache(&self) -> Result<usize, StorageError> {
    self.cache.prune()
  }

  pub fn sync_status(&self) -> Result<SyncStatus, StorageError> {
    Ok(SyncStatus {
      is_online: self.connectivity.is_online(),
      is_syncing: self.syncing.load(Ordering::Acquire),
      pending_items: self.queue.count()?,
      last_sync_time: *lock(&self.last_sync),
      sync_errors: lock(&self.errors).clone(),
    })
  }

  pub fn clear_sync_errors(&self) {
    lock(&self.errors).clear();
  }

  /// Replay the queue whenever connectivity comes back.
  ///
  /// Transitions are observed from the moment of this call. Every change
  /// that ends online triggers a pass; a quick offline/online flap may
  /// arrive as one notification. The task ends when this `OfflineSync` is
  /// dropped.
  pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
    let mut rx = self.connectivity.subscribe();
    let mut was_online = *rx.borrow_and_update();
    let this: Weak<Self> = Arc::downgrade(self);

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        let Some(sync) = this.upgrade() else {
          break;
        };

        if online {
          if !was_online {
            tracing::info!("back online, replaying queued operations");
          }
          if let Err(e) = sync.process_sync_queue().await {
            tracing::error!(error = %e, "sync pass failed");
          }
        } else if was_online {
          tracing::info!("offline, sync paused");
        }
        was_online = online;
      }
    })
  }
}
