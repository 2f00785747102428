//! HTTP client for the remote news API.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use crate::error::FetchError;
use crate::sync::{RemoteResult, RemoteSource};

use super::api_types::ApiNewsResponse;
use super::types::{encode_articles, ArticleQuery};

/// Some news providers sit behind bot protection that rejects the default
/// client UA, so we present a desktop browser.
const USER_AGENT: &str =
  "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// News API client wrapper.
///
/// Performs exactly one HTTP attempt per [`fetch`](RemoteSource::fetch)
/// call; retries and backoff are the coordinator's job.
#[derive(Clone)]
pub struct NewsClient {
  http: reqwest::Client,
  base_url: Url,
  api_key: String,
  page_size: u32,
}

impl NewsClient {
  pub fn new(base_url: &str, api_key: String, page_size: u32) -> Result<Self, FetchError> {
    // A trailing slash matters to Url::join: without it the last path
    // segment would be replaced instead of appended.
    let base_url = if base_url.ends_with('/') {
      Url::parse(base_url)
    } else {
      Url::parse(&format!("{}/", base_url))
    }
    .map_err(|e| FetchError::Network(format!("invalid base url: {}", e)))?;

    let http = reqwest::Client::builder()
      .timeout(DEFAULT_TIMEOUT)
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| FetchError::Network(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      http,
      base_url,
      api_key,
      page_size,
    })
  }

  /// Build the endpoint URL for a query.
  fn endpoint_url(&self, query: &ArticleQuery) -> Result<Url, FetchError> {
    let (path, pairs) = match query {
      ArticleQuery::Search {
        query,
        language,
        sort_by,
      } => {
        let mut pairs = vec![
          ("q".to_string(), query.clone()),
          ("sortBy".to_string(), sort_by.as_str().to_string()),
        ];
        if let Some(lang) = language {
          pairs.push(("language".to_string(), lang.clone()));
        }
        ("everything", pairs)
      }
      ArticleQuery::TopHeadlines { category, country } => {
        let mut pairs = vec![("category".to_string(), category.clone())];
        if let Some(country) = country {
          pairs.push(("country".to_string(), country.clone()));
        }
        ("top-headlines", pairs)
      }
    };

    let mut url = self
      .base_url
      .join(path)
      .map_err(|e| FetchError::Network(format!("invalid endpoint url: {}", e)))?;

    {
      let mut qp = url.query_pairs_mut();
      for (k, v) in &pairs {
        qp.append_pair(k, v);
      }
      qp.append_pair("pageSize", &self.page_size.to_string());
    }

    Ok(url)
  }
}

#[async_trait]
impl RemoteSource for NewsClient {
  async fn fetch(
    &self,
    query: &ArticleQuery,
    etag: Option<&str>,
  ) -> Result<RemoteResult, FetchError> {
    let url = self.endpoint_url(query)?;

    let mut request = self
      .http
      .get(url)
      .header("X-Api-Key", &self.api_key)
      .header("Accept", "application/json");

    if let Some(etag) = etag {
      request = request.header("If-None-Match", etag);
    }

    let response = request.send().await.map_err(map_reqwest_err)?;

    match response.status() {
      StatusCode::NOT_MODIFIED => return Ok(RemoteResult::Unchanged),
      StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
        return Err(FetchError::AuthRequired)
      }
      status if !status.is_success() => {
        return Err(FetchError::ServerError(status.as_u16()))
      }
      _ => {}
    }

    let new_etag = response
      .headers()
      .get(reqwest::header::ETAG)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let bytes = response.bytes().await.map_err(map_reqwest_err)?;
    let body: ApiNewsResponse =
      serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))?;

    if body.status != "ok" {
      let detail = body
        .message
        .or(body.code)
        .unwrap_or_else(|| "unknown API error".to_string());
      return Err(FetchError::Malformed(detail));
    }

    let articles = body.into_articles();
    let payload = encode_articles(&articles)
      .map_err(|e| FetchError::Malformed(format!("failed to encode articles: {}", e)))?;

    Ok(RemoteResult::Updated {
      payload,
      etag: new_etag,
    })
  }
}

fn map_reqwest_err(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout
  } else {
    FetchError::Network(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::news::types::SortBy;

  fn client() -> NewsClient {
    NewsClient::new("https://newsapi.example/v2/", "test-key".into(), 50).unwrap()
  }

  #[test]
  fn search_url_carries_query_params() {
    let url = client()
      .endpoint_url(&ArticleQuery::Search {
        query: "rust async".into(),
        language: Some("en".into()),
        sort_by: SortBy::Popularity,
      })
      .unwrap();

    assert_eq!(url.path(), "/v2/everything");
    let pairs: Vec<(String, String)> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    assert!(pairs.contains(&("q".into(), "rust async".into())));
    assert!(pairs.contains(&("language".into(), "en".into())));
    assert!(pairs.contains(&("sortBy".into(), "popularity".into())));
    assert!(pairs.contains(&("pageSize".into(), "50".into())));
  }

  #[test]
  fn headlines_url_uses_top_headlines_endpoint() {
    let url = client()
      .endpoint_url(&ArticleQuery::TopHeadlines {
        category: "technology".into(),
        country: Some("us".into()),
      })
      .unwrap();

    assert_eq!(url.path(), "/v2/top-headlines");
    assert!(url.query().unwrap().contains("category=technology"));
    assert!(url.query().unwrap().contains("country=us"));
  }

  #[test]
  fn rejects_invalid_base_url() {
    assert!(NewsClient::new("not a url", "k".into(), 10).is_err());
  }
}
