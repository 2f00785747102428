use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sync::SyncPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  /// Freshness/retry/concurrency knobs for the sync engine.
  #[serde(default)]
  pub sync: SyncPolicy,
  /// Override for the cache database location.
  pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL of the news service.
  pub base_url: String,
  /// Results requested per fetch.
  pub page_size: u32,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://newsapi.org/v2/".to_string(),
      page_size: 50,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./newsdeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/newsdeck/config.yaml
  ///
  /// Every field has a default, so a missing config file just means
  /// defaults; only an explicit path that doesn't exist is an error.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("newsdeck.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("newsdeck").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the news API key from environment variables.
  ///
  /// Checks NEWSDECK_API_KEY first, then NEWSAPI_KEY as fallback. The key
  /// never lives in the config file.
  pub fn get_api_key() -> Result<String> {
    std::env::var("NEWSDECK_API_KEY")
      .or_else(|_| std::env::var("NEWSAPI_KEY"))
      .map_err(|_| {
        eyre!("News API key not found. Set NEWSDECK_API_KEY or NEWSAPI_KEY environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn parses_full_config() {
    let yaml = r#"
api:
  base_url: https://example.org/v2/
  page_size: 20
sync:
  max_age: 120
  retry_backoff: [1, 2, 4, 8]
  max_concurrent_fetches: 2
  dedupe_window: 5
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.api.base_url, "https://example.org/v2/");
    assert_eq!(config.api.page_size, 20);
    assert_eq!(config.sync.max_age, Duration::from_secs(120));
    assert_eq!(config.sync.retry_backoff.len(), 4);
    assert_eq!(config.sync.max_concurrent_fetches, 2);
  }

  #[test]
  fn empty_config_uses_defaults() {
    let config: Config = serde_yaml::from_str("{}").unwrap();
    assert_eq!(config.api.page_size, 50);
    assert_eq!(config.sync.max_age, Duration::from_secs(300));
    assert!(config.cache_path.is_none());
  }
}
