//! The observable repository: the public entry point of the engine.
//!
//! A [`Repository`] ties the coordinator to a set of per-subscription
//! update channels. `subscribe` returns the current cached value (or none)
//! immediately and a [`Subscription`] whose stream delivers every later
//! update for that key; nothing here ever blocks on the network.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{StoreError, SyncError};
use crate::news::types::ArticleQuery;
use crate::store::LocalStore;
use crate::sync::{RemoteSource, SyncCoordinator, SyncPolicy, UpdateEvent};

/// The cached value handed back synchronously from `subscribe`.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub payload: Vec<u8>,
  pub fetched_at: DateTime<Utc>,
  pub etag: Option<String>,
  /// True when the entry was already past its max age (a background
  /// refresh is on its way).
  pub is_stale: bool,
}

struct SubscriberEntry {
  id: u64,
  tx: mpsc::UnboundedSender<UpdateEvent>,
}

type Registry = Mutex<HashMap<String, Vec<SubscriberEntry>>>;

/// A live subscription to one key's updates.
///
/// Dropping it (or calling [`unsubscribe`](Subscription::unsubscribe))
/// deregisters the channel and releases fetch interest; no update is ever
/// delivered afterwards.
pub struct Subscription {
  key: String,
  rx: mpsc::UnboundedReceiver<UpdateEvent>,
  cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
  /// Cache key this subscription watches.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Wait for the next update. `None` after `unsubscribe`.
  pub async fn next_update(&mut self) -> Option<UpdateEvent> {
    self.rx.recv().await
  }

  /// Explicitly end the subscription. Equivalent to dropping it.
  pub fn unsubscribe(mut self) {
    self.run_cleanup();
  }

  fn run_cleanup(&mut self) {
    if let Some(cleanup) = self.cleanup.take() {
      cleanup();
    }
    self.rx.close();
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.run_cleanup();
  }
}

impl futures::Stream for Subscription {
  type Item = UpdateEvent;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<UpdateEvent>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

/// Single public entry point: serves cached values, exposes update
/// streams, and delegates all mutation to the sync coordinator.
pub struct Repository<S, R> {
  coordinator: Arc<SyncCoordinator<S, R>>,
  registry: Arc<Registry>,
  next_sub_id: AtomicU64,
  dispatcher: JoinHandle<()>,
}

impl<S, R> Repository<S, R>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  pub fn new(store: Arc<S>, source: Arc<R>, policy: SyncPolicy) -> Self {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<UpdateEvent>();
    let coordinator = SyncCoordinator::new(store, source, policy, events_tx);
    let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));

    // Fan updates out to subscribers. Sending happens under the registry
    // lock, the same lock unsubscribe takes to deregister, so a removed
    // subscriber can never receive a later event.
    let dispatcher = {
      let registry = Arc::clone(&registry);
      tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
          let subscribers = registry.lock().expect("registry lock poisoned");
          if let Some(entries) = subscribers.get(&event.key) {
            for entry in entries {
              let _ = entry.tx.send(event.clone());
            }
          }
        }
      })
    };

    Self {
      coordinator,
      registry,
      next_sub_id: AtomicU64::new(0),
      dispatcher,
    }
  }

  pub fn policy(&self) -> &SyncPolicy {
    self.coordinator.policy()
  }

  pub fn store(&self) -> &Arc<S> {
    self.coordinator.store()
  }

  /// Subscribe to a query: returns the current cached value (or `None`)
  /// plus a stream of future updates. Kicks off whatever fetching the
  /// sync policy requires; never waits for it.
  pub fn subscribe(
    &self,
    query: &ArticleQuery,
  ) -> Result<(Option<Snapshot>, Subscription), SyncError> {
    let key = query.cache_key();
    let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = mpsc::unbounded_channel();

    // Register before the read so an update completing in between is not
    // lost.
    self
      .registry
      .lock()
      .expect("registry lock poisoned")
      .entry(key.clone())
      .or_default()
      .push(SubscriberEntry { id, tx });
    self.coordinator.add_interest(&key);

    let subscription = Subscription {
      key: key.clone(),
      rx,
      cleanup: Some(self.cleanup_fn(key.clone(), id)),
    };

    debug!(%key, id, query = %query.description(), "subscribed");

    let entry = match self.coordinator.subscribe_read(query) {
      Ok(entry) => entry,
      Err(e) => {
        // Dropping the subscription deregisters it again.
        drop(subscription);
        return Err(e);
      }
    };

    let max_age = self.coordinator.policy().max_age;
    let snapshot = entry.map(|e| Snapshot {
      is_stale: e.is_stale(max_age),
      payload: e.payload,
      fetched_at: e.fetched_at,
      etag: e.etag,
    });

    Ok((snapshot, subscription))
  }

  /// Refresh a key regardless of freshness. De-duplicates against any
  /// in-flight fetch and cannot be cancelled by unrelated unsubscribes.
  pub async fn force_refresh(&self, query: &ArticleQuery) -> Result<(), SyncError> {
    self.coordinator.force_refresh(query).await
  }

  /// Drop a key's cached entry. Explicit eviction only.
  pub fn evict(&self, query: &ArticleQuery) -> Result<(), StoreError> {
    self.coordinator.evict(query)
  }

  fn cleanup_fn(&self, key: String, id: u64) -> Box<dyn FnOnce() + Send> {
    let registry = Arc::clone(&self.registry);
    let coordinator = Arc::clone(&self.coordinator);
    Box::new(move || {
      {
        let mut subscribers = registry.lock().expect("registry lock poisoned");
        if let Some(entries) = subscribers.get_mut(&key) {
          entries.retain(|e| e.id != id);
          if entries.is_empty() {
            subscribers.remove(&key);
          }
        }
      }
      coordinator.release_interest(&key);
      debug!(%key, id, "unsubscribed");
    })
  }
}

impl<S, R> Drop for Repository<S, R> {
  fn drop(&mut self) {
    self.dispatcher.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::FetchError;
  use crate::news::types::{decode_articles, encode_articles, Article, ArticleSource};
  use crate::store::{CacheEntry, MemoryStore};
  use crate::sync::{RemoteResult, UpdateKind};
  use futures::StreamExt;
  use std::collections::VecDeque;
  use std::time::Duration;

  struct ScriptSource {
    script: Mutex<VecDeque<Result<RemoteResult, FetchError>>>,
  }

  impl ScriptSource {
    fn new(script: Vec<Result<RemoteResult, FetchError>>) -> Arc<Self> {
      Arc::new(Self {
        script: Mutex::new(script.into()),
      })
    }
  }

  #[async_trait::async_trait]
  impl RemoteSource for ScriptSource {
    async fn fetch(
      &self,
      _query: &ArticleQuery,
      _etag: Option<&str>,
    ) -> Result<RemoteResult, FetchError> {
      self
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Err(FetchError::Network("script exhausted".into())))
    }
  }

  fn article(url: &str) -> Article {
    Article {
      url: url.into(),
      title: url.into(),
      description: None,
      author: None,
      source: ArticleSource {
        id: None,
        name: "Test".into(),
      },
      image_url: None,
      published_at: None,
      content: None,
    }
  }

  fn updated_articles(urls: &[&str]) -> Result<RemoteResult, FetchError> {
    let articles: Vec<Article> = urls.iter().map(|u| article(u)).collect();
    Ok(RemoteResult::Updated {
      payload: encode_articles(&articles).unwrap(),
      etag: None,
    })
  }

  fn policy() -> SyncPolicy {
    SyncPolicy {
      max_age: Duration::from_secs(60),
      retry_backoff: vec![],
      max_concurrent_fetches: 2,
      dedupe_window: Duration::ZERO,
    }
  }

  fn repository(
    source: Arc<ScriptSource>,
  ) -> Repository<MemoryStore, ScriptSource> {
    Repository::new(Arc::new(MemoryStore::new()), source, policy())
  }

  #[tokio::test]
  async fn subscribe_to_absent_key_streams_first_fetch() {
    let repo = repository(ScriptSource::new(vec![updated_articles(&[
      "https://example.com/a",
    ])]));
    let query = ArticleQuery::search("rust");

    let (snapshot, mut sub) = repo.subscribe(&query).unwrap();
    assert!(snapshot.is_none());

    let update = sub.next_update().await.unwrap();
    match update.kind {
      UpdateKind::Value { payload, from_cache } => {
        assert!(!from_cache);
        let articles = decode_articles(&payload).unwrap();
        assert_eq!(articles[0].url, "https://example.com/a");
      }
      other => panic!("expected value, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn stale_snapshot_then_refreshed_update() {
    let source = ScriptSource::new(vec![updated_articles(&["https://example.com/new"])]);
    let repo = repository(source);
    let query = ArticleQuery::search("rust");

    let old_payload = encode_articles(&[article("https://example.com/old")]).unwrap();
    let mut entry = CacheEntry::fresh(query.cache_key(), old_payload, None);
    entry.fetched_at = Utc::now() - chrono::Duration::hours(1);
    repo.store().put(&entry).unwrap();

    let (snapshot, mut sub) = repo.subscribe(&query).unwrap();
    let snapshot = snapshot.unwrap();
    assert!(snapshot.is_stale);
    let cached = decode_articles(&snapshot.payload).unwrap();
    assert_eq!(cached[0].url, "https://example.com/old");

    let update = sub.next_update().await.unwrap();
    match update.kind {
      UpdateKind::Value { payload, from_cache } => {
        assert!(!from_cache);
        let fresh = decode_articles(&payload).unwrap();
        assert_eq!(fresh[0].url, "https://example.com/new");
      }
      other => panic!("expected value, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn subscription_works_as_a_stream() {
    let repo = repository(ScriptSource::new(vec![updated_articles(&[
      "https://example.com/a",
    ])]));
    let query = ArticleQuery::headlines("technology");

    let (_, mut sub) = repo.subscribe(&query).unwrap();
    let update = sub.next().await.unwrap();
    assert!(matches!(update.kind, UpdateKind::Value { .. }));
  }

  #[tokio::test]
  async fn unsubscribe_deregisters_and_stops_delivery() {
    let source = ScriptSource::new(vec![
      updated_articles(&["https://example.com/a"]),
      updated_articles(&["https://example.com/b"]),
    ]);
    let repo = repository(source);
    let query = ArticleQuery::search("rust");
    let key = query.cache_key();

    let (_, mut sub_a) = repo.subscribe(&query).unwrap();
    let (_, mut sub_b) = repo.subscribe(&query).unwrap();
    sub_a.next_update().await.unwrap();
    sub_b.next_update().await.unwrap();

    sub_a.unsubscribe();
    assert_eq!(
      repo.registry.lock().unwrap().get(&key).map(|e| e.len()),
      Some(1)
    );

    // The remaining subscriber still gets the forced refresh.
    repo.force_refresh(&query).await.unwrap();
    let update = sub_b.next_update().await.unwrap();
    assert!(matches!(update.kind, UpdateKind::Value { .. }));

    drop(sub_b);
    assert!(repo.registry.lock().unwrap().get(&key).is_none());
  }

  #[tokio::test]
  async fn failure_is_streamed_not_hung() {
    let repo = repository(ScriptSource::new(vec![Err(FetchError::AuthRequired)]));
    let query = ArticleQuery::search("rust");

    let (snapshot, mut sub) = repo.subscribe(&query).unwrap();
    assert!(snapshot.is_none());

    let update = sub.next_update().await.unwrap();
    assert!(matches!(
      update.kind,
      UpdateKind::Failed(SyncError::Fetch(FetchError::AuthRequired))
    ));
  }

  #[tokio::test]
  async fn fresh_snapshot_is_served_without_updates() {
    let repo = repository(ScriptSource::new(vec![]));
    let query = ArticleQuery::search("rust");

    let payload = encode_articles(&[article("https://example.com/a")]).unwrap();
    repo
      .store()
      .put(&CacheEntry::fresh(query.cache_key(), payload, None))
      .unwrap();

    let (snapshot, mut sub) = repo.subscribe(&query).unwrap();
    let snapshot = snapshot.unwrap();
    assert!(!snapshot.is_stale);

    // No fetch was scheduled; the stream stays quiet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sub.rx.try_recv().is_err());
  }
}
