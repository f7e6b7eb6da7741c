//! Static fallback dataset: bundled snapshot of representative records.
//!
//! The dataset is the last data tier before a caller supplied default. It is
//! loaded once at startup and never changes afterwards. Keys are logical
//! names such as `posts-by-service:ai`, independent of cache keys.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::cache::Cacheable;

/// Snapshot compiled into the binary.
const BUNDLED: &str = include_str!("../data/fallback.json");

/// Immutable key to record map.
#[derive(Debug, Clone, Default)]
pub struct StaticDataset {
  entries: HashMap<String, serde_json::Value>,
}

impl StaticDataset {
  /// Dataset with no entries; every lookup misses.
  pub fn empty() -> Self {
    Self::default()
  }

  /// The snapshot bundled with the crate.
  pub fn bundled() -> Result<Self> {
    Self::from_json(BUNDLED).map_err(|e| eyre!("Bundled fallback dataset is invalid: {}", e))
  }

  /// Parse a JSON object mapping logical keys to records.
  pub fn from_json(json: &str) -> Result<Self> {
    let entries: HashMap<String, serde_json::Value> =
      serde_json::from_str(json).map_err(|e| eyre!("Failed to parse fallback dataset: {}", e))?;
    Ok(Self { entries })
  }

  /// Load a dataset file from disk.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read fallback dataset {}: {}", path.display(), e))?;
    let dataset = Self::from_json(&contents)
      .map_err(|e| eyre!("Invalid fallback dataset {}: {}", path.display(), e))?;
    debug!(path = %path.display(), keys = dataset.len(), "loaded fallback dataset");
    Ok(dataset)
  }

  /// Add an entry while building the dataset.
  pub fn with_entry<T: Serialize>(mut self, key: &str, value: &T) -> Result<Self> {
    let json = serde_json::to_value(value)
      .map_err(|e| eyre!("Failed to serialise fallback entry {}: {}", key, e))?;
    self.entries.insert(key.to_string(), json);
    Ok(self)
  }

  /// Look up a record. A missing key, or a record that does not decode as
  /// `T`, is a miss.
  pub fn lookup<T: Cacheable>(&self, key: &str) -> Option<T> {
    let value = self.entries.get(key)?;
    serde_json::from_value(value.clone())
      .map_err(|e| debug!(key, error = %e, "fallback record does not match requested type"))
      .ok()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
