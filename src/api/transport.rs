//! The seam between the request client and the HTTP stack.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// HTTP verbs the backend accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One part of a multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub enum MultipartPart {
  Text {
    name: String,
    value: String,
  },
  File {
    name: String,
    file_name: String,
    mime: Option<String>,
    bytes: Vec<u8>,
  },
}

/// Request body encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
  /// `application/json`, the default for every endpoint
  Json(Value),
  /// `application/x-www-form-urlencoded`, only used by the login endpoint
  Form(Vec<(String, String)>),
  /// `multipart/form-data` for file uploads
  Multipart(Vec<MultipartPart>),
}

/// A fully resolved request, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: Method,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Body>,
}

/// A response as received, before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub status_text: String,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: reason_phrase(status).to_string(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, value.to_string())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// The request never produced a response.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Something that can put a request on the wire.
///
/// The client enforces timeouts by dropping the returned future, so
/// implementations must be cancel-safe.
pub trait Transport: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

/// Transport backed by `reqwest`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }
}

impl Transport for ReqwestTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
    Box::pin(async move {
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
      };

      let mut builder = self.client.request(method, &request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }

      builder = match request.body {
        Some(Body::Json(value)) => builder.body(value.to_string()),
        Some(Body::Form(pairs)) => builder.form(&pairs),
        Some(Body::Multipart(parts)) => builder.multipart(build_form(parts)?),
        None => builder,
      };

      let response = builder
        .send()
        .await
        .map_err(|e| TransportError(e.to_string()))?;

      let status = response.status();
      let body = response
        .bytes()
        .await
        .map_err(|e| TransportError(format!("failed to read response body: {e}")))?;

      Ok(HttpResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        body: body.to_vec(),
      })
    })
  }
}

fn build_form(parts: Vec<MultipartPart>) -> Result<reqwest::multipart::Form, TransportError> {
  let mut form = reqwest::multipart::Form::new();
  for part in parts {
    form = match part {
      MultipartPart::Text { name, value } => form.text(name, value),
      MultipartPart::File {
        name,
        file_name,
        mime,
        bytes,
      } => {
        let mut file = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        if let Some(mime) = mime {
          file = file
            .mime_str(&mime)
            .map_err(|e| TransportError(format!("invalid mime type {mime}: {e}")))?;
        }
        form.part(name, file)
      }
    };
  }
  Ok(form)
}

fn reason_phrase(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
