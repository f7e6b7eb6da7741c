//! Core traits and types for the tiered fetch system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Values that can travel through the cache and the static dataset.
///
/// Both tiers hold JSON, so anything serde can round-trip qualifies.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Typed key for a logical read.
///
/// Implementors describe the query in a stable string form; the cache key is
/// derived from it by hashing, so two equivalent queries share one entry.
pub trait QueryKey {
  /// Canonical, unhashed form of the query (e.g. "posts_by_service:ai").
  fn canonical(&self) -> String;

  /// Human readable description for logs.
  fn description(&self) -> String;

  /// Key into the static fallback dataset, if this query has one.
  fn local_key(&self) -> Option<String> {
    None
  }

  /// Namespace prefix prepended to the hash, so related keys can be
  /// invalidated together.
  fn namespace(&self) -> &'static str;

  /// Stable cache key: `namespace:sha256(canonical)`.
  fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    format!("{}:{}", self.namespace(), hex::encode(hasher.finalize()))
  }
}

/// Result of a tiered fetch, tagged with the tier that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T> {
  /// The actual data
  pub data: T,
  /// Which tier served it
  pub source: Source,
  /// When the data was produced; for cache hits, when it was stored
  pub timestamp: DateTime<Utc>,
}

impl<T> FetchResult<T> {
  pub fn live(data: T, now: DateTime<Utc>) -> Self {
    Self {
      data,
      source: Source::Live,
      timestamp: now,
    }
  }

  pub fn cached(data: T, stored_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: Source::Cache,
      timestamp: stored_at,
    }
  }

  pub fn local(data: T, now: DateTime<Utc>) -> Self {
    Self {
      data,
      source: Source::Local,
      timestamp: now,
    }
  }

  pub fn default_data(data: T, now: DateTime<Utc>) -> Self {
    Self {
      data,
      source: Source::Default,
      timestamp: now,
    }
  }

  /// True when the data did not come from the live source.
  pub fn is_degraded(&self) -> bool {
    self.source.is_degraded()
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchResult<U> {
    FetchResult {
      data: f(self.data),
      source: self.source,
      timestamp: self.timestamp,
    }
  }
}

/// Indicates where fetched data came from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  /// Fresh data from the live operation
  Live,
  /// Unexpired cache entry
  Cache,
  /// Bundled static dataset
  Local,
  /// Caller supplied fallback value
  Default,
}

impl Source {
  pub fn is_degraded(self) -> bool {
    self != Source::Live
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Source::Live => "live",
      Source::Cache => "cache",
      Source::Local => "local",
      Source::Default => "default",
    }
  }
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Key(&'static str);

  impl QueryKey for Key {
    fn canonical(&self) -> String {
      self.0.to_string()
    }

    fn description(&self) -> String {
      format!("key {}", self.0)
    }

    fn namespace(&self) -> &'static str {
      "test"
    }
  }

  #[test]
  fn test_cache_hash_is_stable_and_namespaced() {
    let a = Key("posts").cache_hash();
    let b = Key("posts").cache_hash();
    assert_eq!(a, b);
    assert!(a.starts_with("test:"));
    assert_eq!(a.len(), "test:".len() + 64);
    assert_ne!(a, Key("services").cache_hash());
  }

  #[test]
  fn test_only_live_is_not_degraded() {
    assert!(!Source::Live.is_degraded());
    assert!(Source::Cache.is_degraded());
    assert!(Source::Local.is_degraded());
    assert!(Source::Default.is_degraded());
  }
}
