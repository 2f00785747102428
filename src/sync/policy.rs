//! Tunable knobs for the sync engine.

use serde::Deserialize;
use std::time::Duration;

/// Freshness, retry, and concurrency policy.
///
/// Loaded from the `sync` section of the config file; every field has a
/// default so an empty section works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
  /// Entries older than this are stale and trigger background
  /// revalidation on read.
  #[serde(with = "duration_secs")]
  pub max_age: Duration,

  /// Backoff delays between retry attempts. Length bounds the attempt
  /// count: a fetch gets `retry_backoff.len() + 1` attempts total.
  #[serde(with = "duration_secs_vec")]
  pub retry_backoff: Vec<Duration>,

  /// Upper bound on concurrent remote fetches across all keys.
  pub max_concurrent_fetches: usize,

  /// A key whose fetch completed within this window is not re-enqueued
  /// for background revalidation.
  #[serde(with = "duration_secs")]
  pub dedupe_window: Duration,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      max_age: Duration::from_secs(300),
      retry_backoff: vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
      ],
      max_concurrent_fetches: 4,
      dedupe_window: Duration::from_secs(2),
    }
  }
}

impl SyncPolicy {
  /// Backoff delay before retry attempt `attempt` (1-based), or `None`
  /// once the sequence is exhausted.
  pub fn backoff_for(&self, attempt: usize) -> Option<Duration> {
    self.retry_backoff.get(attempt - 1).copied()
  }

  /// Total attempts a fetch may make, first try included.
  pub fn max_attempts(&self) -> usize {
    self.retry_backoff.len() + 1
  }
}

mod duration_secs {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    let secs = f64::deserialize(deserializer)?;
    Ok(Duration::from_secs_f64(secs))
  }
}

mod duration_secs_vec {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
  where
    D: Deserializer<'de>,
  {
    let secs: Vec<f64> = Vec::deserialize(deserializer)?;
    Ok(secs.into_iter().map(Duration::from_secs_f64).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_sequence_is_walked_then_exhausted() {
    let policy = SyncPolicy::default();
    assert_eq!(policy.backoff_for(1), Some(Duration::from_secs(1)));
    assert_eq!(policy.backoff_for(3), Some(Duration::from_secs(4)));
    assert_eq!(policy.backoff_for(4), None);
    assert_eq!(policy.max_attempts(), 4);
  }

  #[test]
  fn deserializes_from_yaml_with_defaults() {
    let policy: SyncPolicy = serde_yaml::from_str("max_age: 60\n").unwrap();
    assert_eq!(policy.max_age, Duration::from_secs(60));
    // Unspecified fields fall back to defaults
    assert_eq!(policy.max_concurrent_fetches, 4);

    let policy: SyncPolicy =
      serde_yaml::from_str("retry_backoff: [0.5, 1]\ndedupe_window: 0\n").unwrap();
    assert_eq!(policy.retry_backoff.len(), 2);
    assert_eq!(policy.retry_backoff[0], Duration::from_millis(500));
    assert_eq!(policy.dedupe_window, Duration::ZERO);
  }
}
