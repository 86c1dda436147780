//! Test doubles for the transport and the backoff clock.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::retry::Sleeper;
use super::transport::{HttpRequest, HttpResponse, Transport, TransportError};

#[derive(Clone)]
enum Scripted {
  Respond(HttpResponse),
  Fail(String),
  Hang,
}

/// Transport that answers from a script and records every request.
pub struct ScriptedTransport {
  script: Mutex<VecDeque<Scripted>>,
  fallback: Mutex<Scripted>,
  requests: Mutex<Vec<HttpRequest>>,
  delay: Duration,
}

impl Default for ScriptedTransport {
  fn default() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      fallback: Mutex::new(Scripted::Fail("no scripted response".into())),
      requests: Mutex::new(Vec::new()),
      delay: Duration::ZERO,
    }
  }
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay every answer, to keep a call in flight.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn respond(&self, status: u16, body: Value) -> &Self {
    self.push(Scripted::Respond(HttpResponse::json(status, &body)))
  }

  pub fn respond_raw(&self, status: u16, body: &str) -> &Self {
    self.push(Scripted::Respond(HttpResponse::new(status, body)))
  }

  pub fn fail(&self, message: &str) -> &Self {
    self.push(Scripted::Fail(message.to_string()))
  }

  pub fn hang(&self) -> &Self {
    self.push(Scripted::Hang)
  }

  /// Answer used once the script runs out.
  pub fn always(&self, status: u16, body: Value) -> &Self {
    *self.fallback.lock().unwrap() = Scripted::Respond(HttpResponse::json(status, &body));
    self
  }

  pub fn always_fail(&self, message: &str) -> &Self {
    *self.fallback.lock().unwrap() = Scripted::Fail(message.to_string());
    self
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  fn push(&self, scripted: Scripted) -> &Self {
    self.script.lock().unwrap().push_back(scripted);
    self
  }
}

impl Transport for ScriptedTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
    self.requests.lock().unwrap().push(request);
    let next = self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
    let delay = self.delay;

    Box::pin(async move {
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      match next {
        Scripted::Respond(response) => Ok(response),
        Scripted::Fail(message) => Err(TransportError(message)),
        Scripted::Hang => futures::future::pending().await,
      }
    })
  }
}

/// Sleeper that returns immediately and remembers what it was asked.
#[derive(Default)]
pub struct RecordingSleeper {
  delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
  pub fn delays(&self) -> Vec<Duration> {
    self.delays.lock().unwrap().clone()
  }
}

impl Sleeper for RecordingSleeper {
  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
    self.delays.lock().unwrap().push(duration);
    Box::pin(async {})
  }
}
