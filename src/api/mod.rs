//! Resilient request client for the case-management backend.
//!
//! Every call goes through [`ApiClient::request`], which:
//! - attaches the session's bearer token
//! - enforces a per-attempt timeout
//! - expires the session on 401
//! - retries timeouts, network failures, 408, 429 and 5xx with exponential backoff

mod client;
mod error;
mod retry;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ApiClient, LoginResponse, RequestOptions, API_PREFIX, DEFAULT_TIMEOUT};
pub use error::{is_retryable_status, ApiError};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use transport::{
  Body, HttpRequest, HttpResponse, Method, MultipartPart, ReqwestTransport, Transport,
  TransportError,
};
