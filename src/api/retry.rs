//! Exponential backoff with jitter.

use futures::future::BoxFuture;
use rand::Rng;
use std::time::Duration;

/// How many times to try a call and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles for each one after
  pub base_delay: Duration,
  /// Ceiling on any single delay, jitter included
  pub max_delay: Duration,
  /// Upper bound of the uniform random jitter added to each delay
  pub max_jitter: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_secs(30),
      max_jitter: Duration::from_millis(1000),
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay to wait after `attempt` (1-based) failed, before the next one.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let jitter_ms = self.max_jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
      rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
      0
    };
    self.capped(self.backoff(attempt) + Duration::from_millis(jitter))
  }

  /// The deterministic part of the delay, capped at `max_delay`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base_ms = self.base_delay.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay_ms).min(self.max_delay)
  }

  fn capped(&self, delay: Duration) -> Duration {
    delay.min(self.max_delay)
  }
}

/// Clock abstraction for backoff waits.
pub trait Sleeper: Send + Sync {
  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
    Box::pin(tokio::time::sleep(duration))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(3), Duration::from_millis(400));
  }

  #[test]
  fn test_backoff_is_capped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff(20), Duration::from_secs(30));
    assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
  }

  #[test]
  fn test_jitter_stays_in_range() {
    let policy = RetryPolicy::default();
    for _ in 0..50 {
      let delay = policy.delay_after(1);
      assert!(delay >= Duration::from_millis(100));
      assert!(delay <= Duration::from_millis(1100));
    }
  }

  #[test]
  fn test_zero_jitter_is_deterministic() {
    let policy = RetryPolicy {
      max_jitter: Duration::ZERO,
      ..RetryPolicy::default()
    };
    assert_eq!(policy.delay_after(2), Duration::from_millis(200));
  }
}
