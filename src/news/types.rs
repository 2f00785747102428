//! Domain types for news content and the queries that fetch it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where an article was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSource {
  pub id: Option<String>,
  pub name: String,
}

/// A single news article.
///
/// The article URL is the entity key: two articles with the same URL are
/// the same article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
  pub url: String,
  pub title: String,
  pub description: Option<String>,
  pub author: Option<String>,
  pub source: ArticleSource,
  /// URL of the lead image; decoding is the image pipeline's problem.
  pub image_url: Option<String>,
  /// Publication time as reported by the API (RFC 3339).
  pub published_at: Option<String>,
  pub content: Option<String>,
}

/// How search results are ordered by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
  #[default]
  PublishedAt,
  Relevancy,
  Popularity,
}

impl SortBy {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortBy::PublishedAt => "publishedAt",
      SortBy::Relevancy => "relevancy",
      SortBy::Popularity => "popularity",
    }
  }
}

/// A cacheable news query. Each variant maps to one remote endpoint and
/// one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleQuery {
  /// Full-text search across everything the service indexes.
  Search {
    query: String,
    language: Option<String>,
    sort_by: SortBy,
  },
  /// Current top headlines for a category.
  TopHeadlines {
    category: String,
    country: Option<String>,
  },
}

impl ArticleQuery {
  /// Convenience constructor for a plain search.
  pub fn search(query: impl Into<String>) -> Self {
    ArticleQuery::Search {
      query: query.into(),
      language: None,
      sort_by: SortBy::default(),
    }
  }

  /// Convenience constructor for category headlines.
  pub fn headlines(category: impl Into<String>) -> Self {
    ArticleQuery::TopHeadlines {
      category: category.into(),
      country: None,
    }
  }

  /// Stable cache key for this query.
  ///
  /// SHA-256 of the normalized description, so keys have a fixed length
  /// and case/whitespace variations of the same search collapse to one
  /// cache entry.
  pub fn cache_key(&self) -> String {
    let input = match self {
      ArticleQuery::Search {
        query,
        language,
        sort_by,
      } => format!(
        "search:{}:{}:{}",
        normalize_query(query),
        language.as_deref().unwrap_or(""),
        sort_by.as_str()
      ),
      ArticleQuery::TopHeadlines { category, country } => format!(
        "headlines:{}:{}",
        normalize_query(category),
        country.as_deref().unwrap_or("")
      ),
    };

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable description for logs.
  pub fn description(&self) -> String {
    match self {
      ArticleQuery::Search { query, .. } => format!("search: {}", query),
      ArticleQuery::TopHeadlines { category, .. } => {
        format!("headlines: {}", category)
      }
    }
  }
}

/// Normalize a query string for consistent hashing.
/// Trims whitespace and lowercases for case-insensitive matching.
fn normalize_query(q: &str) -> String {
  q.trim().to_lowercase()
}

/// Decode a cached payload back into articles.
pub fn decode_articles(payload: &[u8]) -> Result<Vec<Article>, serde_json::Error> {
  serde_json::from_slice(payload)
}

/// Encode articles into the canonical cached payload.
pub fn encode_articles(articles: &[Article]) -> Result<Vec<u8>, serde_json::Error> {
  serde_json::to_vec(articles)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cache_key_is_case_and_whitespace_insensitive() {
    let a = ArticleQuery::search("Rust Programming");
    let b = ArticleQuery::search("  rust programming ");
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn cache_key_distinguishes_variants() {
    let search = ArticleQuery::search("tech");
    let headlines = ArticleQuery::headlines("tech");
    assert_ne!(search.cache_key(), headlines.cache_key());
  }

  #[test]
  fn articles_round_trip_through_payload() {
    let articles = vec![Article {
      url: "https://example.com/a".into(),
      title: "Example".into(),
      description: None,
      author: Some("A. Writer".into()),
      source: ArticleSource {
        id: None,
        name: "Example News".into(),
      },
      image_url: None,
      published_at: Some("2026-01-01T00:00:00Z".into()),
      content: None,
    }];

    let payload = encode_articles(&articles).unwrap();
    assert_eq!(decode_articles(&payload).unwrap(), articles);
  }
}
