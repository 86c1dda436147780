use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::error::ApiError;
use super::retry::{RetryPolicy, Sleeper, TokioSleeper};
use super::transport::{Body, HttpRequest, HttpResponse, Method, MultipartPart, Transport};
use crate::session::Session;

/// Path prefix every endpoint lives under.
pub const API_PREFIX: &str = "/api/v1";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call options. Unset fields fall back to the client's defaults.
#[derive(Debug, Clone)]
pub struct RequestOptions {
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Body>,
  /// Attach the session's bearer token
  pub requires_auth: bool,
  /// Hard deadline for each attempt; `None` uses the client default
  pub timeout: Option<Duration>,
  /// Make exactly one attempt
  pub skip_retry: bool,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      method: Method::Get,
      headers: BTreeMap::new(),
      body: None,
      requires_auth: true,
      timeout: None,
      skip_retry: false,
    }
  }
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn json(self, value: Value) -> Self {
    self.body(Body::Json(value))
  }

  pub fn body(mut self, body: Body) -> Self {
    self.body = Some(body);
    self
  }

  pub fn no_auth(mut self) -> Self {
    self.requires_auth = false;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn skip_retry(mut self) -> Self {
    self.skip_retry = true;
    self
  }
}

/// Body returned by the login endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginResponse {
  pub access_token: String,
  #[serde(default)]
  pub token_type: Option<String>,
}

/// Backend API client with timeouts, bearer auth and retry.
#[derive(Clone)]
pub struct ApiClient {
  base_url: String,
  transport: Arc<dyn Transport>,
  session: Session,
  retry: RetryPolicy,
  sleeper: Arc<dyn Sleeper>,
  default_timeout: Duration,
}

impl ApiClient {
  /// Create a client for the backend at `base_url` (without the `/api/v1` prefix).
  pub fn new(base_url: &str, transport: Arc<dyn Transport>, session: Session) -> Self {
    Self {
      base_url: format!("{}{}", base_url.trim_end_matches('/'), API_PREFIX),
      transport,
      session,
      retry: RetryPolicy::default(),
      sleeper: Arc::new(TokioSleeper),
      default_timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
    self.sleeper = sleeper;
    self
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = timeout;
    self
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  /// Full URL for an endpoint path.
  pub fn url(&self, endpoint: &str) -> String {
    if endpoint.starts_with('/') {
      format!("{}{}", self.base_url, endpoint)
    } else {
      format!("{}/{}", self.base_url, endpoint)
    }
  }

  /// Perform one logical call, retrying transient failures.
  ///
  /// A 204 (or an empty success body) is decoded from JSON `null`, so `()`,
  /// `Option<_>` and `Value` are the natural result types for such calls.
  pub async fn request<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    let value = self.request_value(endpoint, &options).await?;
    serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
  }

  async fn request_value(&self, endpoint: &str, options: &RequestOptions) -> Result<Value, ApiError> {
    let max_attempts = if options.skip_retry {
      1
    } else {
      self.retry.max_attempts.max(1)
    };
    let timeout = options.timeout.unwrap_or(self.default_timeout);

    let mut attempt = 1;
    loop {
      match self.attempt(endpoint, options, timeout).await {
        Ok(value) => return Ok(value),
        Err(e) if attempt >= max_attempts || !e.is_retryable() => {
          if attempt > 1 {
            tracing::warn!(%endpoint, attempts = attempt, error = %e, "giving up on request");
          }
          return Err(e);
        }
        Err(e) => {
          let delay = self.retry.delay_after(attempt);
          tracing::warn!(
            %endpoint,
            method = %options.method,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "request failed, retrying"
          );
          self.sleeper.sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }

  async fn attempt(
    &self,
    endpoint: &str,
    options: &RequestOptions,
    timeout: Duration,
  ) -> Result<Value, ApiError> {
    let response = self.send_once(endpoint, options, timeout).await?;
    self.interpret(response)
  }

  async fn send_once(
    &self,
    endpoint: &str,
    options: &RequestOptions,
    timeout: Duration,
  ) -> Result<HttpResponse, ApiError> {
    let request = self.build_request(endpoint, options);
    tracing::debug!(method = %request.method, url = %request.url, "sending request");

    // Dropping the send future on timeout aborts the in-flight call.
    match tokio::time::timeout(timeout, self.transport.send(request)).await {
      Err(_) => Err(ApiError::Timeout {
        endpoint: endpoint.to_string(),
        after: timeout,
      }),
      Ok(Err(e)) => Err(ApiError::Network(e.0)),
      Ok(Ok(response)) => Ok(response),
    }
  }

  /// Single unauthenticated GET that reports whatever status the backend
  /// answers with. The status is not interpreted, so a 401 here leaves the
  /// session untouched.
  pub async fn ping(&self, endpoint: &str, timeout: Duration) -> Result<u16, ApiError> {
    let options = RequestOptions::new().no_auth();
    let response = self.send_once(endpoint, &options, timeout).await?;
    Ok(response.status)
  }

  fn build_request(&self, endpoint: &str, options: &RequestOptions) -> HttpRequest {
    let mut headers = BTreeMap::new();
    headers.insert("Accept".to_string(), "application/json".to_string());
    if matches!(options.body, None | Some(Body::Json(_))) {
      headers.insert("Content-Type".to_string(), "application/json".to_string());
    }

    if options.requires_auth {
      match self.session.token() {
        Ok(Some(token)) => {
          headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "could not read auth token, sending unauthenticated"),
      }
    }

    headers.extend(options.headers.clone());

    HttpRequest {
      method: options.method,
      url: self.url(endpoint),
      headers,
      body: options.body.clone(),
    }
  }

  fn interpret(&self, response: HttpResponse) -> Result<Value, ApiError> {
    if response.status == 401 {
      // Expire already logs storage faults; the caller only needs Unauthorized.
      let _ = self.session.expire();
      return Err(ApiError::Unauthorized);
    }

    if response.status == 204 {
      return Ok(Value::Null);
    }

    if response.is_success() {
      if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
      }
      return serde_json::from_slice(&response.body)
        .map_err(|e| ApiError::InvalidResponse(e.to_string()));
    }

    let data = serde_json::from_slice(&response.body).unwrap_or_else(|_| json!({}));
    Err(ApiError::Status {
      status: response.status,
      status_text: response.status_text,
      data,
    })
  }

  /// GET an endpoint.
  pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
    self.request(endpoint, RequestOptions::new()).await
  }

  /// POST a JSON body.
  pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    body: &B,
  ) -> Result<T, ApiError> {
    self.send_json(Method::Post, endpoint, body).await
  }

  /// PUT a JSON body.
  pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    body: &B,
  ) -> Result<T, ApiError> {
    self.send_json(Method::Put, endpoint, body).await
  }

  /// PATCH a JSON body.
  pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    body: &B,
  ) -> Result<T, ApiError> {
    self.send_json(Method::Patch, endpoint, body).await
  }

  /// DELETE an endpoint.
  pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
    self
      .request(endpoint, RequestOptions::new().method(Method::Delete))
      .await
  }

  async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    method: Method,
    endpoint: &str,
    body: &B,
  ) -> Result<T, ApiError> {
    let body = serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    self
      .request(endpoint, RequestOptions::new().method(method).json(body))
      .await
  }

  /// Exchange credentials for a token on the form-encoded login endpoint
  /// and persist it in the session.
  pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
    let form = vec![
      ("username".to_string(), username.to_string()),
      ("password".to_string(), password.to_string()),
    ];
    let options = RequestOptions::new()
      .method(Method::Post)
      .body(Body::Form(form))
      .no_auth()
      .skip_retry();

    let response: LoginResponse = self.request("/auth/login", options).await?;
    self.session.set_token(&response.access_token)?;
    tracing::info!(%username, "logged in");

    Ok(response)
  }

  /// Drop the session token and notify listeners.
  pub fn logout(&self) -> Result<(), ApiError> {
    self.session.expire()?;
    Ok(())
  }

  /// Upload a file as `multipart/form-data` with a `file` part plus text fields.
  pub async fn upload<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    file_name: &str,
    bytes: Vec<u8>,
    fields: &[(&str, &str)],
  ) -> Result<T, ApiError> {
    let mut parts: Vec<MultipartPart> = fields
      .iter()
      .map(|(name, value)| MultipartPart::Text {
        name: name.to_string(),
        value: value.to_string(),
      })
      .collect();
    parts.push(MultipartPart::File {
      name: "file".to_string(),
      file_name: file_name.to_string(),
      mime: None,
      bytes,
    });

    let options = RequestOptions::new()
      .method(Method::Post)
      .body(Body::Multipart(parts));
    self.request(endpoint, options).await
  }
}
