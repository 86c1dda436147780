//! Online/offline state and the probe that keeps it current.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time;

use crate::api::ApiClient;

/// Shared connectivity flag.
///
/// Cloning shares the same underlying state; subscribers see every
/// transition.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Periodically checks whether the backend is reachable.
pub struct ConnectivityProbe {
  client: ApiClient,
  connectivity: Connectivity,
  endpoint: String,
  interval: Duration,
  timeout: Duration,
}

impl ConnectivityProbe {
  pub fn new(client: ApiClient, connectivity: Connectivity, endpoint: impl Into<String>) -> Self {
    Self {
      client,
      connectivity,
      endpoint: endpoint.into(),
      interval: Duration::from_secs(15),
      timeout: Duration::from_secs(5),
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Probe once and update the shared flag.
  ///
  /// Any HTTP answer counts as online, even an error status; only timeouts
  /// and transport failures count as offline.
  pub async fn check(&self) -> bool {
    let online = match self.client.ping(&self.endpoint, self.timeout).await {
      Ok(status) => {
        tracing::trace!(status, endpoint = %self.endpoint, "health check answered");
        true
      }
      Err(e) => !e.is_connectivity(),
    };

    if self.connectivity.set_online(online) {
      tracing::info!(online, endpoint = %self.endpoint, "connectivity changed");
    }
    online
  }

  /// Probe on an interval until shutdown is signalled.
  pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
    tracing::info!(
      interval_secs = self.interval.as_secs(),
      endpoint = %self.endpoint,
      "connectivity probe starting"
    );

    let mut ticker = time::interval(self.interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.check().await;
        }
        _ = shutdown.recv() => {
          tracing::info!("connectivity probe received shutdown signal, exiting loop");
          break;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::testing::ScriptedTransport;
  use crate::session::{MemoryTokenStore, Session};
  use serde_json::json;

  #[test]
  fn test_set_online_reports_changes_only() {
    let connectivity = Connectivity::new(true);
    assert!(!connectivity.set_online(true));
    assert!(connectivity.set_online(false));
    assert!(!connectivity.is_online());
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.clone().set_online(true);

    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }

  fn probe(transport: Arc<ScriptedTransport>, connectivity: Connectivity) -> ConnectivityProbe {
    let client = ApiClient::new("https://cases.test", transport, Session::in_memory());
    ConnectivityProbe::new(client, connectivity, "/health").with_timeout(Duration::from_millis(20))
  }

  #[tokio::test]
  async fn test_probe_marks_offline_on_network_error() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always_fail("connection refused");
    let connectivity = Connectivity::new(true);

    assert!(!probe(transport.clone(), connectivity.clone()).check().await);
    assert!(!connectivity.is_online());
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_probe_marks_offline_on_timeout() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.hang();
    let connectivity = Connectivity::new(true);

    assert!(!probe(transport, connectivity.clone()).check().await);
    assert!(!connectivity.is_online());
  }

  #[tokio::test]
  async fn test_probe_treats_error_status_as_online() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(503, json!({}));
    let connectivity = Connectivity::new(false);

    assert!(probe(transport.clone(), connectivity.clone()).check().await);
    assert!(connectivity.is_online());
    assert!(!transport.requests()[0].headers.contains_key("Authorization"));
  }

  #[tokio::test]
  async fn test_unauthorized_health_check_keeps_session() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(401, json!({"detail": "Not authenticated"}));
    let session = Session::new(Arc::new(MemoryTokenStore::with_token("valid")));
    let mut events = session.subscribe();
    let client = ApiClient::new("https://cases.test", transport.clone(), session.clone());
    let connectivity = Connectivity::new(false);

    let online = ConnectivityProbe::new(client, connectivity.clone(), "/health")
      .check()
      .await;

    assert!(online);
    assert!(connectivity.is_online());
    assert_eq!(session.token().unwrap(), Some("valid".to_string()));
    assert!(events.try_recv().is_err());
  }
}
