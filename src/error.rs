//! Error taxonomy for the sync engine.
//!
//! Three layers, matching the three things that can go wrong:
//! - [`StoreError`]: the local cache database failed.
//! - [`FetchError`]: a single remote request failed.
//! - [`SyncError`]: the coordinator gave up on a key (terminal, delivered
//!   to subscribers).

use thiserror::Error;

/// Failures from the local store.
///
/// `Io` is transient and safe to retry; the other two mean the data on
/// disk can no longer be trusted and must be surfaced, never swallowed.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
  /// The database or a stored row is corrupt and cannot be read.
  #[error("cache store is corrupt: {0}")]
  Corrupt(String),

  /// A transient I/O failure (locked file, full disk, ...).
  #[error("cache store I/O failure: {0}")]
  Io(String),

  /// The on-disk schema version does not match this build.
  #[error("cache schema version mismatch: found {found}, expected {expected}")]
  SchemaMismatch { found: i64, expected: i64 },
}

impl StoreError {
  /// Whether the caller may retry the operation.
  pub fn is_retryable(&self) -> bool {
    matches!(self, StoreError::Io(_))
  }
}

/// Failures from a single remote fetch attempt.
///
/// The remote source performs exactly one attempt per call; whether and
/// how to retry is the coordinator's decision, driven by this
/// classification.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  /// Could not reach the remote service.
  #[error("network error: {0}")]
  Network(String),

  /// The request timed out.
  #[error("request timed out")]
  Timeout,

  /// The service rejected our credentials (401/403).
  #[error("authentication required")]
  AuthRequired,

  /// Non-success HTTP status.
  #[error("server returned status {0}")]
  ServerError(u16),

  /// The response body could not be decoded.
  #[error("malformed response: {0}")]
  Malformed(String),
}

impl FetchError {
  /// Whether the coordinator should walk the backoff sequence before
  /// giving up. Auth and malformed-body failures cannot be fixed by
  /// retrying; neither can a 4xx.
  pub fn is_retryable(&self) -> bool {
    match self {
      FetchError::Network(_) | FetchError::Timeout => true,
      FetchError::ServerError(code) => *code >= 500,
      FetchError::AuthRequired | FetchError::Malformed(_) => false,
    }
  }
}

/// Terminal failures delivered to subscribers.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
  /// Every retry attempt failed; the last fetch error is attached.
  #[error("retries exhausted: {0}")]
  ExhaustedRetries(FetchError),

  /// The fetch was not retryable and failed on its only attempt.
  #[error("fetch failed: {0}")]
  Fetch(FetchError),

  /// The fetch was cancelled before completion.
  #[error("fetch cancelled")]
  Cancelled,

  /// The local store failed while applying a fetch result.
  #[error("store failed: {0}")]
  StoreFailed(StoreError),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryability_classification() {
    assert!(FetchError::Network("reset".into()).is_retryable());
    assert!(FetchError::Timeout.is_retryable());
    assert!(FetchError::ServerError(503).is_retryable());
    assert!(!FetchError::ServerError(404).is_retryable());
    assert!(!FetchError::AuthRequired.is_retryable());
    assert!(!FetchError::Malformed("bad json".into()).is_retryable());

    assert!(StoreError::Io("disk full".into()).is_retryable());
    assert!(!StoreError::Corrupt("bad page".into()).is_retryable());
  }
}
