//! SQLite-backed durable cache store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::news::types::Article;

use super::{CacheEntry, EntryState, LocalStore};

/// Bump when the schema changes incompatibly. Stored in the database's
/// `user_version` pragma; a mismatch on open is surfaced, never repaired
/// silently.
const SCHEMA_VERSION: i64 = 1;

/// How many search history rows to keep.
const SEARCH_HISTORY_CAP: usize = 25;

const SCHEMA: &str = r#"
-- Cached query results (opaque JSON payloads)
CREATE TABLE IF NOT EXISTS entries (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    fetched_at TEXT NOT NULL,
    etag TEXT,
    state TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_fetched_at ON entries(fetched_at);

-- Articles the user saved for later
CREATE TABLE IF NOT EXISTS favorites (
    url TEXT PRIMARY KEY,
    article BLOB NOT NULL,
    saved_at TEXT NOT NULL
);

-- Recent search inputs, newest first
CREATE TABLE IF NOT EXISTS search_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    searched_at TEXT NOT NULL
);
"#;

/// Durable [`LocalStore`] over a single SQLite database.
///
/// The connection lives behind a mutex, so all statements are serialized;
/// per-key atomicity follows from single-statement upserts.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at the default location
  /// (`<data dir>/newsdeck/cache.db`).
  pub fn open() -> Result<Self, StoreError> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::Io(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(map_sqlite_err)?;
    Self::from_connection(conn)
  }

  /// In-memory database; contents vanish on drop. Used in tests.
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.check_schema_version()?;
    store.run_migrations()?;
    Ok(store)
  }

  fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Io("could not determine data directory".into()))?;

    Ok(data_dir.join("newsdeck").join("cache.db"))
  }

  fn check_schema_version(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;

    let found: i64 = conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(map_sqlite_err)?;

    match found {
      0 => {
        // Fresh database; stamp it.
        conn
          .pragma_update(None, "user_version", SCHEMA_VERSION)
          .map_err(map_sqlite_err)?;
        Ok(())
      }
      v if v == SCHEMA_VERSION => Ok(()),
      v => Err(StoreError::SchemaMismatch {
        found: v,
        expected: SCHEMA_VERSION,
      }),
    }
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute_batch(SCHEMA).map_err(map_sqlite_err)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Io(format!("lock poisoned: {}", e)))
  }

  /// Delete the oldest-fetched entries beyond `max_entries`. Explicit
  /// eviction only; reads never trigger this.
  pub fn prune(&self, max_entries: usize) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    let deleted = conn
      .execute(
        "DELETE FROM entries WHERE key NOT IN (
           SELECT key FROM entries ORDER BY fetched_at DESC LIMIT ?
         )",
        params![max_entries as i64],
      )
      .map_err(map_sqlite_err)?;
    Ok(deleted)
  }

  // ==========================================================================
  // Favorites
  // ==========================================================================

  pub fn add_favorite(&self, article: &Article) -> Result<(), StoreError> {
    let data = serde_json::to_vec(article)
      .map_err(|e| StoreError::Io(format!("failed to serialize article: {}", e)))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO favorites (url, article, saved_at) VALUES (?, ?, ?)",
        params![article.url, data, Utc::now().to_rfc3339()],
      )
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  pub fn remove_favorite(&self, url: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM favorites WHERE url = ?", params![url])
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  pub fn is_favorite(&self, url: &str) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT 1 FROM favorites WHERE url = ?")
      .map_err(map_sqlite_err)?;
    stmt.exists(params![url]).map_err(map_sqlite_err)
  }

  /// All saved articles, most recently saved first.
  pub fn favorites(&self) -> Result<Vec<Article>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT article FROM favorites ORDER BY saved_at DESC")
      .map_err(map_sqlite_err)?;

    let rows = stmt
      .query_map([], |row| row.get::<_, Vec<u8>>(0))
      .map_err(map_sqlite_err)?;

    let mut articles = Vec::new();
    for row in rows {
      let data = row.map_err(map_sqlite_err)?;
      let article = serde_json::from_slice(&data)
        .map_err(|e| StoreError::Corrupt(format!("undecodable favorite row: {}", e)))?;
      articles.push(article);
    }
    Ok(articles)
  }

  // ==========================================================================
  // Search history
  // ==========================================================================

  /// Record a search input, keeping the history capped.
  pub fn record_search(&self, query: &str) -> Result<(), StoreError> {
    let query = query.trim();
    if query.is_empty() {
      return Ok(());
    }

    let conn = self.lock()?;
    let tx = unchecked_transaction(&conn)?;
    tx.execute("DELETE FROM search_history WHERE query = ?", params![query])
      .map_err(map_sqlite_err)?;
    tx.execute(
      "INSERT INTO search_history (query, searched_at) VALUES (?, ?)",
      params![query, Utc::now().to_rfc3339()],
    )
    .map_err(map_sqlite_err)?;
    tx.execute(
      "DELETE FROM search_history WHERE id NOT IN (
         SELECT id FROM search_history ORDER BY id DESC LIMIT ?
       )",
      params![SEARCH_HISTORY_CAP as i64],
    )
    .map_err(map_sqlite_err)?;
    tx.commit().map_err(map_sqlite_err)
  }

  /// Recent search inputs, most recent first.
  pub fn recent_searches(&self, limit: usize) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT query FROM search_history ORDER BY id DESC LIMIT ?")
      .map_err(map_sqlite_err)?;

    let rows = stmt
      .query_map(params![limit as i64], |row| row.get::<_, String>(0))
      .map_err(map_sqlite_err)?;

    rows
      .collect::<Result<Vec<_>, _>>()
      .map_err(map_sqlite_err)
  }
}

impl LocalStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT payload, fetched_at, etag, state FROM entries WHERE key = ?")
      .map_err(map_sqlite_err)?;

    let row: Option<(Vec<u8>, String, Option<String>, String)> = stmt
      .query_row(params![key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map(Some)
      .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(map_sqlite_err(other)),
      })?;

    let Some((payload, fetched_at, etag, state)) = row else {
      return Ok(None);
    };

    let fetched_at = parse_datetime(&fetched_at)?;
    let state = EntryState::parse(&state)
      .ok_or_else(|| StoreError::Corrupt(format!("unknown entry state '{}'", state)))?;

    Ok(Some(CacheEntry {
      key: key.to_string(),
      payload,
      fetched_at,
      etag,
      state,
    }))
  }

  fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO entries (key, payload, fetched_at, etag, state)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.key,
          entry.payload,
          entry.fetched_at.to_rfc3339(),
          entry.etag,
          entry.state.as_str()
        ],
      )
      .map_err(map_sqlite_err)?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM entries WHERE key = ?", params![key])
      .map_err(map_sqlite_err)?;
    Ok(())
  }
}

/// Start an explicit transaction on a borrowed connection.
fn unchecked_transaction(
  conn: &Connection,
) -> Result<rusqlite::Transaction<'_>, StoreError> {
  conn.unchecked_transaction().map_err(map_sqlite_err)
}

/// Map rusqlite failures onto the store taxonomy: corruption-class codes
/// become `Corrupt`, everything else is transient `Io`.
fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
  match &e {
    rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
      ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
        StoreError::Corrupt(e.to_string())
      }
      _ => StoreError::Io(e.to_string()),
    },
    rusqlite::Error::FromSqlConversionFailure(..)
    | rusqlite::Error::IntegralValueOutOfRange(..)
    | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(e.to_string()),
    _ => StoreError::Io(e.to_string()),
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::news::types::ArticleSource;

  fn article(url: &str) -> Article {
    Article {
      url: url.into(),
      title: format!("Article at {}", url),
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

  #[test]
  fn entry_round_trip() {
    let store = SqliteStore::in_memory().unwrap();
    let entry = CacheEntry::fresh("k1", b"[1,2,3]".to_vec(), Some("etag-1".into()));

    store.put(&entry).unwrap();
    let got = store.get("k1").unwrap().unwrap();
    assert_eq!(got.payload, entry.payload);
    assert_eq!(got.etag, entry.etag);
    assert_eq!(got.state, EntryState::Fresh);
    // RFC 3339 keeps sub-second precision, so timestamps survive intact
    assert_eq!(got.fetched_at, entry.fetched_at);

    store.delete("k1").unwrap();
    assert!(store.get("k1").unwrap().is_none());
  }

  #[test]
  fn put_overwrites_in_place() {
    let store = SqliteStore::in_memory().unwrap();
    store
      .put(&CacheEntry::fresh("k1", b"old".to_vec(), None))
      .unwrap();
    store
      .put(&CacheEntry::fresh("k1", b"new".to_vec(), Some("e2".into())))
      .unwrap();

    let got = store.get("k1").unwrap().unwrap();
    assert_eq!(got.payload, b"new");
    assert_eq!(got.etag.as_deref(), Some("e2"));
  }

  #[test]
  fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store
        .put(&CacheEntry::fresh("k1", b"persisted".to_vec(), None))
        .unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    let got = store.get("k1").unwrap().unwrap();
    assert_eq!(got.payload, b"persisted");
  }

  #[test]
  fn schema_version_mismatch_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let conn = Connection::open(&path).unwrap();
      conn.pragma_update(None, "user_version", 99).unwrap();
    }

    match SqliteStore::open_at(&path) {
      Err(StoreError::SchemaMismatch { found, expected }) => {
        assert_eq!(found, 99);
        assert_eq!(expected, SCHEMA_VERSION);
      }
      other => panic!("expected SchemaMismatch, got {:?}", other.err()),
    }
  }

  #[test]
  fn favorites_round_trip() {
    let store = SqliteStore::in_memory().unwrap();
    store.add_favorite(&article("https://example.com/a")).unwrap();
    store.add_favorite(&article("https://example.com/b")).unwrap();

    assert!(store.is_favorite("https://example.com/a").unwrap());
    assert_eq!(store.favorites().unwrap().len(), 2);

    store.remove_favorite("https://example.com/a").unwrap();
    assert!(!store.is_favorite("https://example.com/a").unwrap());
    assert_eq!(store.favorites().unwrap().len(), 1);
  }

  #[test]
  fn search_history_is_capped_and_deduped() {
    let store = SqliteStore::in_memory().unwrap();
    for i in 0..30 {
      store.record_search(&format!("query {}", i)).unwrap();
    }

    let recent = store.recent_searches(100).unwrap();
    assert_eq!(recent.len(), SEARCH_HISTORY_CAP);
    assert_eq!(recent[0], "query 29");

    // Repeating a search moves it to the front instead of duplicating it
    store.record_search("query 20").unwrap();
    let recent = store.recent_searches(5).unwrap();
    assert_eq!(recent[0], "query 20");
    assert_eq!(recent.iter().filter(|q| *q == "query 20").count(), 1);
  }

  #[test]
  fn prune_keeps_newest() {
    let store = SqliteStore::in_memory().unwrap();
    for i in 0..10 {
      let mut entry = CacheEntry::fresh(format!("k{}", i), vec![i], None);
      entry.fetched_at = Utc::now() - chrono::Duration::seconds(100 - i as i64);
      store.put(&entry).unwrap();
    }

    let deleted = store.prune(3).unwrap();
    assert_eq!(deleted, 7);
    assert!(store.get("k9").unwrap().is_some());
    assert!(store.get("k0").unwrap().is_none());
  }
}
