//! Serde-deserializable types matching the remote news API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use super::types::{Article, ArticleSource};

#[derive(Debug, Deserialize)]
pub struct ApiSource {
  pub id: Option<String>,
  #[serde(default)]
  pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiArticle {
  pub url: String,
  #[serde(default)]
  pub title: String,
  pub description: Option<String>,
  pub author: Option<String>,
  pub source: Option<ApiSource>,
  pub url_to_image: Option<String>,
  pub published_at: Option<String>,
  pub content: Option<String>,
}

impl ApiArticle {
  pub fn into_article(self) -> Article {
    Article {
      url: self.url,
      title: self.title,
      description: self.description,
      author: self.author,
      source: self
        .source
        .map(|s| ArticleSource {
          id: s.id,
          name: s.name,
        })
        .unwrap_or(ArticleSource {
          id: None,
          name: String::new(),
        }),
      image_url: self.url_to_image,
      published_at: self.published_at,
      content: self.content,
    }
  }
}

/// Top-level envelope of both the search and headlines endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNewsResponse {
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub total_results: u64,
  #[serde(default)]
  pub articles: Vec<ApiArticle>,
  // Present on error responses
  pub code: Option<String>,
  pub message: Option<String>,
}

impl ApiNewsResponse {
  /// Convert the payload into domain articles, dropping entries the API
  /// sometimes emits for removed content (null-ish rows titled "[Removed]").
  pub fn into_articles(self) -> Vec<Article> {
    self
      .articles
      .into_iter()
      .filter(|a| !a.url.is_empty() && a.title != "[Removed]")
      .map(ApiArticle::into_article)
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_response() {
    let body = r#"{
      "status": "ok",
      "totalResults": 1,
      "articles": [{
        "source": {"id": null, "name": "Example"},
        "author": "A. Writer",
        "title": "Hello",
        "description": "World",
        "url": "https://example.com/hello",
        "urlToImage": "https://example.com/hello.jpg",
        "publishedAt": "2026-01-01T00:00:00Z",
        "content": "Hello world"
      }]
    }"#;

    let resp: ApiNewsResponse = serde_json::from_str(body).unwrap();
    assert_eq!(resp.total_results, 1);

    let articles = resp.into_articles();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].url, "https://example.com/hello");
    assert_eq!(articles[0].source.name, "Example");
    assert_eq!(articles[0].image_url.as_deref(), Some("https://example.com/hello.jpg"));
  }

  #[test]
  fn drops_removed_articles() {
    let body = r#"{
      "status": "ok",
      "totalResults": 2,
      "articles": [
        {"url": "https://example.com/a", "title": "Real"},
        {"url": "https://example.com/b", "title": "[Removed]"}
      ]
    }"#;

    let resp: ApiNewsResponse = serde_json::from_str(body).unwrap();
    let articles = resp.into_articles();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].title, "Real");
  }
}
