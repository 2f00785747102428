//! Offline-first news sync engine.
//!
//! Fetches articles from a NewsAPI-compatible service, persists them in a
//! local SQLite cache, and serves one consistent, observable view of that
//! data to any number of concurrent subscribers: stale-while-revalidate,
//! request de-duplication, bounded concurrency, and retry with backoff
//! included.
//!
//! The [`Repository`] is the public entry point: `subscribe` returns the
//! cached value (or none) immediately plus a stream of updates; the engine
//! does the rest in the background.

pub mod config;
pub mod error;
pub mod news;
pub mod repo;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{FetchError, StoreError, SyncError};
pub use news::{Article, ArticleQuery, NewsClient};
pub use repo::{Repository, Snapshot, Subscription};
pub use store::{CacheEntry, EntryState, LocalStore, MemoryStore, SqliteStore};
pub use sync::{RemoteResult, RemoteSource, SyncPolicy, UpdateEvent, UpdateKind};
