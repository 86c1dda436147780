use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::RetryPolicy;
use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// SQLite file for the queue, cache and token (defaults to the data dir)
  pub database: Option<PathBuf>,
  /// Directory for log files (defaults to the data dir)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend origin, without the /api/v1 prefix
  pub base_url: String,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
  30_000
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 100,
      max_delay_ms: 30_000,
      max_jitter_ms: 1_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed replays before a queued operation is dropped
  pub max_attempts: u32,
  pub cache_retention_hours: i64,
  pub probe_interval_secs: u64,
  pub health_endpoint: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      cache_retention_hours: 24 * 7,
      probe_interval_secs: 15,
      health_endpoint: "/health".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./casesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/casesync/config.yaml
  ///
  /// `CASESYNC_API_URL` overrides `api.base_url`.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/casesync/config.yaml"
        ))
      }
    };

    if let Ok(url) = std::env::var("CASESYNC_API_URL") {
      config.api.base_url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("casesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("casesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    let url = url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url {:?}: {}", self.api.base_url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("api.base_url must be http or https, got {}", url.scheme()));
    }
    if self.api.timeout_ms == 0 {
      return Err(eyre!("api.timeout_ms must be positive"));
    }
    if self.retry.max_attempts == 0 || self.sync.max_attempts == 0 {
      return Err(eyre!("max_attempts must be at least 1"));
    }
    Ok(())
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry.max_attempts,
      base_delay: Duration::from_millis(self.retry.base_delay_ms),
      max_delay: Duration::from_millis(self.retry.max_delay_ms),
      max_jitter: Duration::from_millis(self.retry.max_jitter_ms),
    }
  }

  pub fn cache_retention(&self) -> chrono::Duration {
    chrono::Duration::hours(self.sync.cache_retention_hours)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Database::default_path().ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(path) => Ok(path.clone()),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .map(|d| d.join("casesync").join("logs"))
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  /// Get the login password from the environment.
  ///
  /// Checks CASESYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("CASESYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set the CASESYNC_PASSWORD environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  base_url: https://cases.example.com\n").unwrap();

    assert_eq!(config.api.timeout_ms, 30_000);
    assert_eq!(config.retry, RetryConfig::default());
    assert_eq!(config.sync, SyncConfig::default());
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_overrides_are_applied() {
    let yaml = r#"
api:
  base_url: http://localhost:8000
  timeout_ms: 5000
retry:
  max_attempts: 5
sync:
  cache_retention_hours: 1
  health_endpoint: /healthz
database: /tmp/casesync-test.db
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.timeout(), Duration::from_millis(5000));
    assert_eq!(config.retry_policy().max_attempts, 5);
    assert_eq!(config.retry_policy().base_delay, Duration::from_millis(100));
    assert_eq!(config.cache_retention(), chrono::Duration::hours(1));
    assert_eq!(config.sync.health_endpoint, "/healthz");
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/casesync-test.db")
    );
  }

  #[test]
  fn test_rejects_non_http_base_url() {
    let config = Config::from_yaml("api:\n  base_url: ftp://cases.example.com\n").unwrap();
    assert!(config.validate().is_err());

    let config = Config::from_yaml("api:\n  base_url: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/nonexistent/casesync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("casesync.yaml");
    std::fs::write(&path, "api:\n  base_url: https://cases.example.com\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert!(config.api.base_url.starts_with("http"));
  }
}
