//! Offline mutation queue.
//!
//! Mutations that cannot reach the backend are stored durably and replayed
//! in order once connectivity returns:
//! - one replay pass at a time (single-flight)
//! - strict FIFO by enqueue time, sequential within a pass
//! - operations are dropped and reported after three failed replays
//! - reads fall back to the last cached response while offline

mod connectivity;
mod error;
mod manager;
mod operation;
mod store;

pub use connectivity::{Connectivity, ConnectivityProbe};
pub use error::SyncError;
pub use manager::{
  MutationOutcome, OfflineSync, SkipReason, SyncPass, SyncReport, SyncStatus, DEFAULT_MAX_ATTEMPTS,
  MAX_SYNC_ERRORS,
};
pub use operation::{NewOperation, OperationKind, PendingOperation, ResourceKind, Route};
pub use store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
