//! Fetch-vs-cache orchestration.
//!
//! The coordinator decides, per read, whether to serve the cached entry,
//! kick off a background revalidation, or fetch in the foreground. It owns
//! the in-memory pending-fetch set (sharded by key hash), per-key sequence
//! numbers for discarding out-of-order completions, and the retry/backoff
//! walk around the remote source.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{StoreError, SyncError};
use crate::news::types::ArticleQuery;
use crate::store::{CacheEntry, EntryState, LocalStore};

use super::policy::SyncPolicy;
use super::scheduler::{FetchPriority, RequestScheduler};
use super::{RemoteResult, RemoteSource};

const SHARD_COUNT: usize = 16;

/// An update published to subscribers of a key.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
  pub key: String,
  pub kind: UpdateKind,
}

#[derive(Debug, Clone)]
pub enum UpdateKind {
  Value {
    payload: Vec<u8>,
    /// True when the payload was served from the local cache (including a
    /// revalidation that came back `Unchanged`); false for fresh network
    /// content.
    from_cache: bool,
  },
  Failed(SyncError),
}

type FetchWaiter = oneshot::Sender<Result<(), SyncError>>;

/// One in-flight fetch for a key. At most one exists per key at any time.
struct Inflight {
  seq: u64,
  /// Pinned fetches (force_refresh) survive subscriber cancellation.
  pinned: bool,
  abort: AbortHandle,
  waiters: Vec<FetchWaiter>,
}

#[derive(Default)]
struct KeyState {
  /// Sequence number handed to the next fetch for this key.
  next_seq: u64,
  /// Highest sequence number whose result was applied.
  last_applied_seq: u64,
  last_completed_at: Option<Instant>,
  /// Active subscriber count; when it reaches zero an unpinned in-flight
  /// fetch is aborted.
  interest: usize,
  inflight: Option<Inflight>,
  /// Set after a corrupt read was papered over with a delete + refetch;
  /// a second corrupt read is surfaced instead of looping.
  corrupt_retried: bool,
}

/// Orchestrates fetch-vs-cache decisions per key.
pub struct SyncCoordinator<S, R> {
  store: Arc<S>,
  source: Arc<R>,
  policy: SyncPolicy,
  scheduler: Arc<RequestScheduler>,
  shards: Vec<Mutex<HashMap<String, KeyState>>>,
  events: mpsc::UnboundedSender<UpdateEvent>,
}

impl<S, R> SyncCoordinator<S, R>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  pub fn new(
    store: Arc<S>,
    source: Arc<R>,
    policy: SyncPolicy,
    events: mpsc::UnboundedSender<UpdateEvent>,
  ) -> Arc<Self> {
    let scheduler = RequestScheduler::new(policy.max_concurrent_fetches);
    let shards = (0..SHARD_COUNT)
      .map(|_| Mutex::new(HashMap::new()))
      .collect();

    Arc::new(Self {
      store,
      source,
      policy,
      scheduler,
      shards,
      events,
    })
  }

  pub fn policy(&self) -> &SyncPolicy {
    &self.policy
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Serve a subscribe request: return the current entry (or none) and
  /// schedule whatever fetching the policy calls for. Never waits on the
  /// network.
  pub fn subscribe_read(
    self: &Arc<Self>,
    query: &ArticleQuery,
  ) -> Result<Option<CacheEntry>, SyncError> {
    let key = query.cache_key();
    let entry = self.read_entry(&key)?;

    match &entry {
      None => {
        // Nothing to serve; the subscriber is waiting on the stream.
        self.ensure_fetch(query, FetchPriority::Foreground, false, None);
      }
      Some(e) if e.is_stale(self.policy.max_age) => {
        // Stale-while-revalidate: the caller gets the cached entry now,
        // the stream delivers the refresh result later.
        self.ensure_fetch(query, FetchPriority::Background, false, Some(e));
      }
      Some(_) => {}
    }

    Ok(entry)
  }

  /// Fetch regardless of freshness. Attaches to an in-flight fetch if one
  /// exists (and pins it); resolves when the fetch completes.
  pub async fn force_refresh(self: &Arc<Self>, query: &ArticleQuery) -> Result<(), SyncError> {
    let key = query.cache_key();
    let current = self.read_entry(&key)?;

    let Some(ticket) = self.ensure_fetch(
      query,
      FetchPriority::Foreground,
      true,
      current.as_ref(),
    ) else {
      // Pinned requests always schedule or attach; this is unreachable,
      // but a lost ticket must not hang the caller.
      return Err(SyncError::Cancelled);
    };

    match ticket.await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Cancelled),
    }
  }

  /// Register a subscriber's interest in a key.
  pub fn add_interest(&self, key: &str) {
    let mut shard = self.shard(key);
    shard.entry(key.to_string()).or_default().interest += 1;
  }

  /// Drop a subscriber's interest. When the last interested subscriber
  /// goes away, an unpinned in-flight fetch for the key is aborted; its
  /// result is never written to the store.
  pub fn release_interest(&self, key: &str) {
    let mut shard = self.shard(key);
    let Some(ks) = shard.get_mut(key) else {
      return;
    };
    ks.interest = ks.interest.saturating_sub(1);
    if ks.interest > 0 {
      return;
    }

    let cancel = matches!(&ks.inflight, Some(inflight) if !inflight.pinned);
    if cancel {
      if let Some(inflight) = ks.inflight.take() {
        debug!(key, seq = inflight.seq, "aborting fetch, no subscribers left");
        inflight.abort.abort();
        for waiter in inflight.waiters {
          let _ = waiter.send(Err(SyncError::Cancelled));
        }
      }
    }
  }

  /// Explicitly remove a key's cached entry. Eviction is always a caller
  /// decision, never a read side effect.
  pub fn evict(&self, query: &ArticleQuery) -> Result<(), StoreError> {
    let key = query.cache_key();
    let _shard = self.shard(&key);
    self.store.delete(&key)
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, KeyState>> {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let idx = (hasher.finish() as usize) % SHARD_COUNT;
    self.shards[idx].lock().expect("shard lock poisoned")
  }

  /// Read an entry, applying the corruption policy: a corrupt entry is
  /// deleted and treated as absent once; a second corrupt read in a row is
  /// surfaced as unrecoverable.
  fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, SyncError> {
    match self.store.get(key) {
      Ok(entry) => {
        if let Some(ks) = self.shard(key).get_mut(key) {
          ks.corrupt_retried = false;
        }
        Ok(entry)
      }
      Err(e) if e.is_retryable() => {
        // Transient I/O: one immediate retry before giving up.
        self.store.get(key).map_err(SyncError::StoreFailed)
      }
      Err(StoreError::Corrupt(msg)) => {
        let mut shard = self.shard(key);
        let ks = shard.entry(key.to_string()).or_default();
        if ks.corrupt_retried {
          return Err(SyncError::StoreFailed(StoreError::Corrupt(msg)));
        }
        ks.corrupt_retried = true;
        drop(shard);

        warn!(key, error = %msg, "corrupt cache entry, dropping and refetching");
        if let Err(e) = self.store.delete(key) {
          warn!(key, error = %e, "failed to delete corrupt entry");
        }
        Ok(None)
      }
      Err(e) => Err(SyncError::StoreFailed(e)),
    }
  }

  /// Schedule a fetch for a key, or attach to the one already in flight.
  ///
  /// The pending-set entry and the fetch task are created under the same
  /// shard lock, so two racing callers can never start two fetches for one
  /// key. Returns `None` only when a background revalidation was suppressed
  /// by the dedupe window.
  fn ensure_fetch(
    self: &Arc<Self>,
    query: &ArticleQuery,
    priority: FetchPriority,
    pinned: bool,
    current: Option<&CacheEntry>,
  ) -> Option<oneshot::Receiver<Result<(), SyncError>>> {
    let key = query.cache_key();
    let mut shard = self.shard(&key);
    let ks = shard.entry(key.clone()).or_default();

    // De-duplication: attach to the in-flight fetch instead of starting
    // another one.
    if let Some(inflight) = &mut ks.inflight {
      if pinned {
        inflight.pinned = true;
      }
      let (tx, rx) = oneshot::channel();
      inflight.waiters.push(tx);
      return Some(rx);
    }

    // A key that just completed a fetch is not revalidated again within
    // the dedupe window. Forced and foreground fetches are exempt.
    if priority == FetchPriority::Background && !pinned {
      if let Some(done) = ks.last_completed_at {
        if done.elapsed() < self.policy.dedupe_window {
          return None;
        }
      }
    }

    let seq = ks.next_seq;
    ks.next_seq += 1;

    // Stale/Failed -> Pending, written through so the stored state matches
    // the in-memory pending set. A still-fresh entry being force-refreshed
    // keeps its state.
    let etag = current.and_then(|e| e.etag.clone());
    if let Some(entry) = current {
      if entry.is_stale(self.policy.max_age) {
        let mut pending = entry.clone();
        pending.state = EntryState::Pending;
        if let Err(e) = self.store.put(&pending) {
          warn!(%key, error = %e, "failed to mark entry pending");
        }
      }
    }

    let (tx, rx) = oneshot::channel();
    let task = {
      let this = Arc::clone(self);
      let query = query.clone();
      let key = key.clone();
      tokio::spawn(async move {
        this.run_fetch(key, query, seq, priority, etag).await;
      })
    };

    debug!(%key, seq, ?priority, "fetch scheduled");
    ks.inflight = Some(Inflight {
      seq,
      pinned,
      abort: task.abort_handle(),
      waiters: vec![tx],
    });

    Some(rx)
  }

  /// The fetch task: wait for a scheduler slot, walk the retry/backoff
  /// sequence, then apply the outcome.
  async fn run_fetch(
    self: Arc<Self>,
    key: String,
    query: ArticleQuery,
    seq: u64,
    priority: FetchPriority,
    etag: Option<String>,
  ) {
    let permit = self.scheduler.acquire(priority).await;

    let mut attempt = 1;
    let outcome = loop {
      match self.source.fetch(&query, etag.as_deref()).await {
        Ok(result) => break Ok(result),
        Err(e) if e.is_retryable() => match self.policy.backoff_for(attempt) {
          Some(delay) => {
            debug!(%key, seq, attempt, error = %e, delay_ms = delay.as_millis() as u64, "fetch failed, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
          }
          None => break Err(SyncError::ExhaustedRetries(e)),
        },
        Err(e) => break Err(SyncError::Fetch(e)),
      }
    };

    drop(permit);
    self.complete_fetch(&key, seq, outcome);
  }

  /// Apply a fetch outcome under the key's critical section.
  ///
  /// A completion that no longer matches the current in-flight sequence
  /// (cancelled, or a newer fetch already applied) is discarded without
  /// touching the store.
  fn complete_fetch(&self, key: &str, seq: u64, outcome: Result<RemoteResult, SyncError>) {
    let mut shard = self.shard(key);
    let ks = shard.entry(key.to_string()).or_default();

    let matches = ks.inflight.as_ref().map(|i| i.seq) == Some(seq);
    if !matches || seq < ks.last_applied_seq {
      debug!(key, seq, last_applied = ks.last_applied_seq, "discarding stale fetch completion");
      return;
    }

    let Some(inflight) = ks.inflight.take() else {
      return;
    };
    ks.last_applied_seq = seq;
    ks.last_completed_at = Some(Instant::now());

    let result = match outcome {
      Ok(RemoteResult::Updated { payload, etag }) => {
        let entry = CacheEntry::fresh(key, payload, etag);
        match self.put_with_retry(&entry) {
          Ok(()) => {
            ks.corrupt_retried = false;
            self.publish(UpdateEvent {
              key: key.to_string(),
              kind: UpdateKind::Value {
                payload: entry.payload,
                from_cache: false,
              },
            });
            Ok(())
          }
          Err(e) => {
            let err = SyncError::StoreFailed(e);
            self.publish(UpdateEvent {
              key: key.to_string(),
              kind: UpdateKind::Failed(err.clone()),
            });
            Err(err)
          }
        }
      }
      Ok(RemoteResult::Unchanged) => {
        // Content confirmed current: bump fetched_at, leave payload alone.
        match self.store.get(key) {
          Ok(Some(mut entry)) => {
            entry.fetched_at = Utc::now();
            entry.state = EntryState::Fresh;
            match self.put_with_retry(&entry) {
              Ok(()) => {
                self.publish(UpdateEvent {
                  key: key.to_string(),
                  kind: UpdateKind::Value {
                    payload: entry.payload,
                    from_cache: true,
                  },
                });
                Ok(())
              }
              Err(e) => {
                let err = SyncError::StoreFailed(e);
                self.publish(UpdateEvent {
                  key: key.to_string(),
                  kind: UpdateKind::Failed(err.clone()),
                });
                Err(err)
              }
            }
          }
          Ok(None) => {
            warn!(key, "server said unchanged but no cached entry exists");
            Ok(())
          }
          Err(e) => {
            let err = SyncError::StoreFailed(e);
            self.publish(UpdateEvent {
              key: key.to_string(),
              kind: UpdateKind::Failed(err.clone()),
            });
            Err(err)
          }
        }
      }
      Err(err) => {
        // Terminal failure: record it on the entry (if any) and tell the
        // subscribers; nothing retries again until a new read or a forced
        // refresh asks for it.
        if let Ok(Some(mut entry)) = self.store.get(key) {
          entry.state = EntryState::Failed;
          if let Err(e) = self.put_with_retry(&entry) {
            warn!(key, error = %e, "failed to mark entry failed");
          }
        }
        self.publish(UpdateEvent {
          key: key.to_string(),
          kind: UpdateKind::Failed(err.clone()),
        });
        Err(err)
      }
    };

    for waiter in inflight.waiters {
      let _ = waiter.send(result.clone());
    }
  }

  /// One immediate retry for transient store failures during apply.
  fn put_with_retry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
    match self.store.put(entry) {
      Err(e) if e.is_retryable() => self.store.put(entry),
      other => other,
    }
  }

  fn publish(&self, event: UpdateEvent) {
    // The receiver only goes away when the repository shuts down.
    let _ = self.events.send(event);
  }
}
