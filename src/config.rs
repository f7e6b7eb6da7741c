use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::db::Database;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub database: DatabaseConfig,
  pub cache: CacheConfig,
  pub connectivity: ConnectivityConfig,
  pub dataset: DatasetConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  /// Content database file (defaults to $XDG_DATA_HOME/tierfetch/content.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL for entries written by live reads
  pub default_ttl_secs: u64,
  /// Maximum number of cached queries
  pub capacity: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: DEFAULT_TTL.as_secs(),
      capacity: DEFAULT_CAPACITY,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// How often the monitor probes the database
  pub probe_interval_secs: u64,
  /// Upper bound on a single live read
  pub live_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
      live_timeout_ms: 5000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
  /// JSON snapshot to use instead of the bundled one
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Directory for log files (defaults to $XDG_DATA_HOME/tierfetch/logs)
  pub dir: Option<PathBuf>,
  /// Filter directive used when RUST_LOG is unset (e.g. "tierfetch=debug")
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tierfetch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tierfetch/config.yaml
  ///
  /// With no file found, defaults apply. `TIERFETCH_DATABASE` overrides the
  /// database path either way.
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
      None => Self::default(),
    };

    if let Ok(db) = std::env::var("TIERFETCH_DATABASE") {
      config.database.path = Some(PathBuf::from(db));
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tierfetch.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tierfetch").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Reject values that would make the fallback chain misbehave.
  pub fn validate(&self) -> Result<()> {
    if self.cache.default_ttl_secs == 0 {
      return Err(eyre!("cache.default_ttl_secs must be greater than zero"));
    }
    if self.cache.capacity == 0 {
      return Err(eyre!("cache.capacity must be greater than zero"));
    }
    if self.connectivity.probe_interval_secs == 0 {
      return Err(eyre!(
        "connectivity.probe_interval_secs must be greater than zero"
      ));
    }
    if self.connectivity.live_timeout_ms == 0 {
      return Err(eyre!("connectivity.live_timeout_ms must be greater than zero"));
    }
    Ok(())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database.path {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_ttl_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_interval_secs)
  }

  pub fn live_timeout(&self) -> Duration {
    Duration::from_millis(self.connectivity.live_timeout_ms)
  }
}
