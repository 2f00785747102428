//! The sync engine: fetch-vs-cache decisions, request scheduling, and the
//! remote source contract.

mod coordinator;
mod policy;
mod scheduler;

pub use coordinator::{SyncCoordinator, UpdateEvent, UpdateKind};
pub use policy::SyncPolicy;
pub use scheduler::{FetchPriority, Permit, RequestScheduler};

use async_trait::async_trait;

use crate::error::FetchError;
use crate::news::types::ArticleQuery;

/// Outcome of a single conditional fetch.
#[derive(Debug, Clone)]
pub enum RemoteResult {
  /// The server confirmed our cached copy is current (etag matched).
  Unchanged,
  /// New content, already normalized to the canonical payload encoding.
  Updated {
    payload: Vec<u8>,
    etag: Option<String>,
  },
}

/// A typed remote fetcher. One attempt per call; retry policy lives in the
/// coordinator, never here.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
  async fn fetch(
    &self,
    query: &ArticleQuery,
    etag: Option<&str>,
  ) -> Result<RemoteResult, FetchError>;
}
