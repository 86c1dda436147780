//! Cache layer that pairs live fetches with a last-known-good fallback.

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::storage::CacheStore;
use super::traits::{CacheEntry, CacheResult};
use crate::api::ApiError;
use crate::db::StorageError;

/// Cache layer that records successful fetches and serves them back when the
/// network is unavailable.
///
/// Unlike a stale-while-revalidate cache, the live fetch is always tried
/// first; the cache is only read when it fails.
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<dyn CacheStore>,
  /// Entries older than this are removed by `prune`
  retention: Duration,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(store: Arc<dyn CacheStore>) -> Self {
    Self {
      store,
      retention: Duration::days(7),
    }
  }

  pub fn with_retention(mut self, retention: Duration) -> Self {
    self.retention = retention;
    self
  }

  pub fn retention(&self) -> Duration {
    self.retention
  }

  /// Run `fetcher`, caching its result under `key`.
  ///
  /// 1. Fetch from network; on success upsert the cache and return
  /// 2. If the fetch failed and we are offline (or the error says the
  ///    backend is unreachable), return the cached copy if there is one
  /// 3. Otherwise propagate the fetch error
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &str,
    category: &str,
    online: bool,
    fetcher: F,
  ) -> Result<CacheResult<T>, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    match fetcher().await {
      Ok(data) => {
        match serde_json::to_value(&data) {
          Ok(value) => {
            if let Err(e) = self.put(key, value, category) {
              tracing::warn!(%key, error = %e, "failed to cache response");
            }
          }
          Err(e) => tracing::warn!(%key, error = %e, "response not cacheable"),
        }
        Ok(CacheResult::from_network(data))
      }
      Err(err) if !online || err.is_connectivity() => {
        let Some(entry) = self.get(key) else {
          return Err(err);
        };

        match serde_json::from_value(entry.value) {
          Ok(data) => {
            tracing::info!(%key, cached_at = %entry.last_modified, error = %err, "serving cached data");
            Ok(CacheResult::offline(data, entry.last_modified))
          }
          Err(e) => {
            tracing::warn!(%key, error = %e, "cached data no longer matches expected shape");
            Err(err)
          }
        }
      }
      Err(err) => Err(err),
    }
  }

  /// Insert or replace the entry for `key`.
  pub fn put(&self, key: &str, value: Value, category: &str) -> Result<(), StorageError> {
    self.store.put(&CacheEntry::new(key, value, category))
  }

  /// Best-effort read; storage faults are logged and read as a miss.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    match self.store.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(%key, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Remove entries older than the retention window.
  pub fn prune(&self) -> Result<usize, StorageError> {
    self.prune_older_than(self.retention)
  }

  pub fn prune_older_than(&self, retention: Duration) -> Result<usize, StorageError> {
    let removed = self.store.prune_before(Utc::now() - retention)?;
    if removed > 0 {
      tracing::info!(removed, "pruned cache entries");
    }
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryCacheStore;
  use crate::cache::traits::CacheSource;
  use serde_json::json;

  fn layer() -> CacheLayer {
    CacheLayer::new(Arc::new(MemoryCacheStore::new()))
  }

  fn network_error() -> ApiError {
    ApiError::Network("offline".into())
  }

  #[tokio::test]
  async fn test_success_is_cached() {
    let cache = layer();

    let result = cache
      .fetch("cases:x1", "cases", true, || async { Ok(json!({"foo": 1})) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(cache.get("cases:x1").unwrap().value, json!({"foo": 1}));
  }

  #[tokio::test]
  async fn test_offline_failure_serves_cache() {
    let cache = layer();
    cache.put("cases:x1", json!({"foo": 1}), "cases").unwrap();

    let result: CacheResult<Value> = cache
      .fetch("cases:x1", "cases", false, || async { Err(network_error()) })
      .await
      .unwrap();

    assert_eq!(result.data, json!({"foo": 1}));
    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_offline_miss_propagates_error() {
    let cache = layer();

    let err = cache
      .fetch::<Value, _, _>("cases:x2", "cases", false, || async { Err(network_error()) })
      .await
      .unwrap_err();

    assert!(matches!(err, ApiError::Network(_)));
  }

  #[tokio::test]
  async fn test_online_semantic_error_skips_cache() {
    let cache = layer();
    cache.put("cases:x1", json!({"foo": 1}), "cases").unwrap();

    let err = cache
      .fetch::<Value, _, _>("cases:x1", "cases", true, || async {
        Err(ApiError::Status {
          status: 403,
          status_text: "Forbidden".into(),
          data: json!({}),
        })
      })
      .await
      .unwrap_err();

    assert_eq!(err.status(), Some(403));
  }

  #[tokio::test]
  async fn test_prune_uses_retention() {
    let cache = layer().with_retention(Duration::hours(1));
    let mut stale = CacheEntry::new("old", json!(1), "misc");
    stale.last_modified = Utc::now() - Duration::hours(2);
    cache.store.put(&stale).unwrap();
    cache.put("fresh", json!(2), "misc").unwrap();

    assert_eq!(cache.prune().unwrap(), 1);
    assert!(cache.get("old").is_none());
    assert!(cache.get("fresh").is_some());
  }
}
