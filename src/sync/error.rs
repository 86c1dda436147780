use thiserror::Error;

use crate::api::ApiError;
use crate::db::StorageError;

/// Failures surfaced by the offline queue to its callers.
///
/// Replay failures are never returned here; they are counted against the
/// operation and reported through the sync status.
#[derive(Debug, Error)]
pub enum SyncError {
  /// Durable storage failed; the triggering call did not take effect.
  #[error("storage fault: {0}")]
  Storage(#[from] StorageError),

  /// A live call failed with an error that queuing cannot fix.
  #[error(transparent)]
  Api(#[from] ApiError),

  /// The operation can never be replayed as submitted.
  #[error("invalid operation: {0}")]
  InvalidOperation(String),
}
