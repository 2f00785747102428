//! Local cache storage: entry model, storage contract, and backends.

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Lifecycle state of a cache entry.
///
/// Transitions: `Fresh -> Stale` by age only; `Stale`/`Failed -> Pending`
/// when a fetch starts; `Pending -> Fresh | Failed` when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
  Fresh,
  Stale,
  Pending,
  Failed,
}

impl EntryState {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntryState::Fresh => "fresh",
      EntryState::Stale => "stale",
      EntryState::Pending => "pending",
      EntryState::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "fresh" => Some(EntryState::Fresh),
      "stale" => Some(EntryState::Stale),
      "pending" => Some(EntryState::Pending),
      "failed" => Some(EntryState::Failed),
      _ => None,
    }
  }
}

/// One cached resource: opaque payload bytes plus fetch metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Vec<u8>,
  pub fetched_at: DateTime<Utc>,
  pub etag: Option<String>,
  pub state: EntryState,
}

impl CacheEntry {
  /// Build a fresh entry from a completed fetch.
  pub fn fresh(key: impl Into<String>, payload: Vec<u8>, etag: Option<String>) -> Self {
    Self {
      key: key.into(),
      payload,
      fetched_at: Utc::now(),
      etag,
      state: EntryState::Fresh,
    }
  }

  /// Age of the entry relative to now.
  pub fn age(&self) -> Duration {
    (Utc::now() - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
  }

  /// Whether the entry is older than the given maximum age. A stored
  /// `Failed` or `Stale` state also counts as stale regardless of age.
  pub fn is_stale(&self, max_age: Duration) -> bool {
    match self.state {
      EntryState::Fresh | EntryState::Pending => self.age() >= max_age,
      EntryState::Stale | EntryState::Failed => true,
    }
  }
}

/// Storage contract for cached entries.
///
/// Implementations must make `put` atomic per key: a concurrent `get`
/// sees either the previous entry or the new one, never a torn write.
/// Writes to the same key never interleave.
pub trait LocalStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

  fn put(&self, entry: &CacheEntry) -> Result<(), StoreError>;

  fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// HashMap-backed store. Not durable; used in tests and when persistence
/// is disabled.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl LocalStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| StoreError::Io(format!("lock poisoned: {}", e)))?;
    Ok(entries.get(key).cloned())
  }

  fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| StoreError::Io(format!("lock poisoned: {}", e)))?;
    entries.insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| StoreError::Io(format!("lock poisoned: {}", e)))?;
    entries.remove(key);
    Ok(())
  }
}
