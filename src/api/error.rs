use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::db::StorageError;

/// Classified failure of one logical API call.
#[derive(Debug, Error)]
pub enum ApiError {
  /// No response arrived within the per-call timeout.
  #[error("request to {endpoint} timed out after {}ms", after.as_millis())]
  Timeout { endpoint: String, after: Duration },

  /// The transport could not reach the server (DNS, refused connection, TLS).
  #[error("network error: {0}")]
  Network(String),

  /// The server rejected our credentials; the session has been cleared.
  #[error("unauthorized: session expired")]
  Unauthorized,

  /// Any other non-success status.
  #[error("{status} {status_text}")]
  Status {
    status: u16,
    status_text: String,
    data: Value,
  },

  /// A success response whose body did not match the expected shape.
  #[error("invalid response body: {0}")]
  InvalidResponse(String),

  /// The request could not be built (e.g. body failed to encode).
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// The session token could not be persisted.
  #[error("session storage: {0}")]
  Storage(#[from] StorageError),
}

impl ApiError {
  /// Whether the client should retry this failure on its own.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Timeout { .. } | Self::Network(_) => true,
      Self::Status { status, .. } => is_retryable_status(*status),
      Self::Unauthorized | Self::InvalidResponse(_) | Self::InvalidRequest(_) | Self::Storage(_) => {
        false
      }
    }
  }

  /// Whether the failure means the backend could not be reached at all.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Timeout { .. } | Self::Network(_))
  }

  /// HTTP status, when the server answered.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      Self::Unauthorized => Some(401),
      _ => None,
    }
  }

  /// Message for end users, separating "try again later" from "fix the request".
  pub fn user_message(&self) -> String {
    match self {
      Self::Timeout { .. } => "The server took too long to respond. Please try again later.".into(),
      Self::Network(_) => "Unable to reach the server. Check your connection and try again.".into(),
      Self::Unauthorized => "Your session has expired. Please sign in again.".into(),
      Self::Status { status, data, .. } if is_retryable_status(*status) => {
        match server_message(data) {
          Some(msg) => format!("The server is having trouble ({status}): {msg}. Please try again later."),
          None => format!("The server is having trouble ({status}). Please try again later."),
        }
      }
      Self::Status { status, data, .. } => match server_message(data) {
        Some(msg) => format!("The request was rejected ({status}): {msg}"),
        None => format!("The request was rejected ({status})."),
      },
      Self::InvalidResponse(_) => "The server sent an unexpected response.".into(),
      Self::InvalidRequest(msg) => format!("The request is invalid: {msg}"),
      Self::Storage(_) => "Local storage failed. Your changes were not saved.".into(),
    }
  }
}

/// 408, 429 and 5xx may succeed on a later attempt; other statuses will not.
pub fn is_retryable_status(status: u16) -> bool {
  status == 408 || status == 429 || (500..600).contains(&status)
}

fn server_message(data: &Value) -> Option<&str> {
  ["detail", "message", "error"]
    .iter()
    .find_map(|field| data.get(field).and_then(Value::as_str))
}
