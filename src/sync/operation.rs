//! Queued mutations and how they map onto REST calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::SyncError;
use crate::api::{Method, RequestOptions};

/// Backend resources that can be mutated offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  Case,
  Transaction,
  Evidence,
  Note,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 4] = [Self::Case, Self::Transaction, Self::Evidence, Self::Note];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Case => "case",
      Self::Transaction => "transaction",
      Self::Evidence => "evidence",
      Self::Note => "note",
    }
  }

  /// Collection endpoint for this resource.
  pub fn endpoint_base(&self) -> &'static str {
    match self {
      Self::Case => "/cases",
      Self::Transaction => "/transactions",
      Self::Evidence => "/evidence",
      Self::Note => "/notes",
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceKind {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| SyncError::InvalidOperation(format!("unknown resource kind: {s}")))
  }
}

/// What a queued mutation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub const ALL: [OperationKind; 3] = [Self::Create, Self::Update, Self::Delete];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }

  pub fn method(&self) -> Method {
    match self {
      Self::Create => Method::Post,
      Self::Update => Method::Put,
      Self::Delete => Method::Delete,
    }
  }

  /// Whether the operation addresses an existing record by id.
  pub fn targets_existing(&self) -> bool {
    !matches!(self, Self::Create)
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| SyncError::InvalidOperation(format!("unknown operation kind: {s}")))
  }
}

/// A mutation as submitted by a caller, before it is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
  pub resource_kind: ResourceKind,
  pub operation_kind: OperationKind,
  pub payload: Value,
}

impl NewOperation {
  pub fn new(resource_kind: ResourceKind, operation_kind: OperationKind, payload: Value) -> Self {
    Self {
      resource_kind,
      operation_kind,
      payload,
    }
  }

  /// Reject operations that could never be replayed.
  pub fn validate(&self) -> Result<(), SyncError> {
    self.route().map(|_| ())
  }

  /// The REST call this operation becomes.
  pub fn route(&self) -> Result<Route, SyncError> {
    Route::for_operation(self.resource_kind, self.operation_kind, &self.payload)
  }
}

/// A mutation waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: String,
  pub resource_kind: ResourceKind,
  pub operation_kind: OperationKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replays so far; only ever grows
  pub attempt_count: u32,
  pub last_error: Option<String>,
}

impl PendingOperation {
  /// Assign an id and enqueue time.
  pub fn from_new(op: NewOperation) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      resource_kind: op.resource_kind,
      operation_kind: op.operation_kind,
      payload: op.payload,
      enqueued_at: Utc::now(),
      attempt_count: 0,
      last_error: None,
    }
  }

  pub fn route(&self) -> Result<Route, SyncError> {
    Route::for_operation(self.resource_kind, self.operation_kind, &self.payload)
  }

  /// Short human-readable label, e.g. "update transaction t9".
  pub fn describe(&self) -> String {
    match target_id(&self.payload) {
      Some(id) => format!("{} {} {}", self.operation_kind, self.resource_kind, id),
      None => format!("{} {}", self.operation_kind, self.resource_kind),
    }
  }
}

/// Verb, endpoint and body for one replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
  pub method: Method,
  pub endpoint: String,
  pub body: Option<Value>,
}

impl Route {
  /// create → POST base, update → PUT base/{id}, delete → DELETE base/{id}.
  pub fn for_operation(
    resource: ResourceKind,
    operation: OperationKind,
    payload: &Value,
  ) -> Result<Self, SyncError> {
    let base = resource.endpoint_base();

    let route = match operation {
      OperationKind::Create => Self {
        method: Method::Post,
        endpoint: base.to_string(),
        body: Some(payload.clone()),
      },
      OperationKind::Update | OperationKind::Delete => {
        let id = target_id(payload).ok_or_else(|| {
          SyncError::InvalidOperation(format!(
            "{operation} {resource} requires a non-empty \"id\" in the payload"
          ))
        })?;
        if !is_path_segment(&id) {
          return Err(SyncError::InvalidOperation(format!(
            "{operation} {resource}: id {id:?} is not a single path segment"
          )));
        }
        Self {
          method: operation.method(),
          endpoint: format!("{base}/{id}"),
          body: (operation == OperationKind::Update).then(|| payload.clone()),
        }
      }
    };

    Ok(route)
  }

  pub fn options(&self) -> RequestOptions {
    let options = RequestOptions::new().method(self.method);
    match &self.body {
      Some(body) => options.json(body.clone()),
      None => options,
    }
  }
}

/// The `id` field of a payload, as a string.
fn target_id(payload: &Value) -> Option<String> {
  match payload.get("id")? {
    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Ids are spliced into the URL path and must stay within one segment.
fn is_path_segment(id: &str) -> bool {
  !matches!(id, "." | "..")
    && !id
      .chars()
      .any(|c| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_control())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_kinds() {
    assert_eq!("case".parse::<ResourceKind>().unwrap(), ResourceKind::Case);
    assert_eq!(" Evidence ".parse::<ResourceKind>().unwrap(), ResourceKind::Evidence);
    assert_eq!("DELETE".parse::<OperationKind>().unwrap(), OperationKind::Delete);
    assert!("invoice".parse::<ResourceKind>().is_err());
    assert!("upsert".parse::<OperationKind>().is_err());
  }

  #[test]
  fn test_serde_uses_lowercase_names() {
    let op = NewOperation::new(ResourceKind::Note, OperationKind::Create, json!({}));
    let encoded = serde_json::to_value(&op).unwrap();
    assert_eq!(encoded["resource_kind"], "note");
    assert_eq!(encoded["operation_kind"], "create");
  }

  #[test]
  fn test_create_posts_to_collection() {
    let payload = json!({"subject_name": "Acme"});
    let route = Route::for_operation(ResourceKind::Case, OperationKind::Create, &payload).unwrap();

    assert_eq!(route.method, Method::Post);
    assert_eq!(route.endpoint, "/cases");
    assert_eq!(route.body, Some(payload));
  }

  #[test]
  fn test_update_puts_to_record() {
    let payload = json!({"id": "t9", "category": "wire"});
    let route =
      Route::for_operation(ResourceKind::Transaction, OperationKind::Update, &payload).unwrap();

    assert_eq!(route.method, Method::Put);
    assert_eq!(route.endpoint, "/transactions/t9");
    assert_eq!(route.body, Some(payload));
  }

  #[test]
  fn test_delete_has_no_body() {
    let route =
      Route::for_operation(ResourceKind::Evidence, OperationKind::Delete, &json!({"id": 42}))
        .unwrap();

    assert_eq!(route.method, Method::Delete);
    assert_eq!(route.endpoint, "/evidence/42");
    assert_eq!(route.body, None);
  }

  #[test]
  fn test_update_without_id_is_rejected() {
    for payload in [json!({}), json!({"id": ""}), json!({"id": null})] {
      let op = NewOperation::new(ResourceKind::Note, OperationKind::Update, payload);
      assert!(matches!(op.validate(), Err(SyncError::InvalidOperation(_))));
    }
  }

  #[test]
  fn test_id_must_be_a_single_path_segment() {
    for id in ["../admin", "..", "c1/notes", "c1?status=closed", "c1#x", "c%2F1", "c\n1"] {
      let op = NewOperation::new(ResourceKind::Case, OperationKind::Delete, json!({"id": id}));
      assert!(
        matches!(op.validate(), Err(SyncError::InvalidOperation(_))),
        "accepted id {id:?}"
      );
    }

    let route =
      Route::for_operation(ResourceKind::Case, OperationKind::Delete, &json!({"id": "case-7.v2"}))
        .unwrap();
    assert_eq!(route.endpoint, "/cases/case-7.v2");
  }

  #[test]
  fn test_from_new_assigns_identity() {
    let a = PendingOperation::from_new(NewOperation::new(
      ResourceKind::Case,
      OperationKind::Create,
      json!({}),
    ));
    let b = PendingOperation::from_new(NewOperation::new(
      ResourceKind::Case,
      OperationKind::Create,
      json!({}),
    ));

    assert_ne!(a.id, b.id);
    assert_eq!(a.attempt_count, 0);
    assert!(a.enqueued_at <= b.enqueued_at);
  }
}
