//! News domain: article types, query keys, and the remote API client.

pub mod api_types;
pub mod client;
pub mod types;

pub use client::NewsClient;
pub use types::{Article, ArticleQuery, ArticleSource, SortBy};
