//! Core types for the response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Last successfully fetched body for one logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// Logical identity of the request (e.g. "cases:x1")
  pub key: String,
  /// Response body as fetched
  pub value: Value,
  /// When the entry was last written
  pub last_modified: DateTime<Utc>,
  /// Free-form classification tag
  pub category: String,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, value: Value, category: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      value,
      last_modified: Utc::now(),
      category: category.into(),
    }
  }
}

/// Result from a cached fetch, including metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result served from cache because the network was unavailable.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable, serving the last cached copy
  Offline,
}

/// Derive a stable, fixed-length cache key from a request endpoint.
///
/// Used when the caller has no logical key of its own. The endpoint is
/// trimmed and the query string parameters are sorted so that equivalent
/// requests share an entry.
pub fn request_key(endpoint: &str) -> String {
  let endpoint = endpoint.trim();
  let normalized = match endpoint.split_once('?') {
    Some((path, query)) => {
      let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
      params.sort_unstable();
      format!("{}?{}", path.trim_end_matches('/'), params.join("&"))
    }
    None => endpoint.trim_end_matches('/').to_string(),
  };

  let mut hasher = Sha256::new();
  hasher.update(normalized.as_bytes());
  format!("request:{}", hex::encode(hasher.finalize()))
}
