//! In-memory cache store with per-entry TTL and an LRU size bound.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::Cacheable;
use crate::clock::{Clock, SystemClock};

/// Default time-to-live for entries written without an explicit TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of entries.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A single cached value as seen by readers.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
  pub value: T,
  /// When the value was written
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
}

/// Counters describing cache behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// Entries dropped because their TTL ran out
  pub expirations: u64,
  /// Entries dropped to stay within capacity
  pub evictions: u64,
  pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
  value: serde_json::Value,
  stored_at: DateTime<Utc>,
  ttl: Duration,
  /// Recency tick, key into `Entries::recency`
  touched: u64,
}

impl CacheEntry {
  /// Valid iff `now - stored_at < ttl`. A clock that moved backwards counts
  /// as zero elapsed time.
  fn is_valid(&self, now: DateTime<Utc>) -> bool {
    match (now - self.stored_at).to_std() {
      Ok(elapsed) => elapsed < self.ttl,
      Err(_) => true,
    }
  }
}

#[derive(Debug, Default)]
struct Entries {
  map: HashMap<String, CacheEntry>,
  /// Oldest tick first
  recency: BTreeMap<u64, String>,
  tick: u64,
}

impl Entries {
  fn next_tick(&mut self) -> u64 {
    self.tick += 1;
    self.tick
  }

  fn touch(&mut self, key: &str) {
    let tick = self.next_tick();
    if let Some(entry) = self.map.get_mut(key) {
      self.recency.remove(&entry.touched);
      entry.touched = tick;
      self.recency.insert(tick, key.to_string());
    }
  }

  fn insert(&mut self, key: String, value: serde_json::Value, stored_at: DateTime<Utc>, ttl: Duration) {
    let tick = self.next_tick();
    if let Some(old) = self.map.remove(&key) {
      self.recency.remove(&old.touched);
    }
    self.recency.insert(tick, key.clone());
    self.map.insert(
      key,
      CacheEntry {
        value,
        stored_at,
        ttl,
        touched: tick,
      },
    );
  }

  fn remove(&mut self, key: &str) -> bool {
    match self.map.remove(key) {
      Some(entry) => {
        self.recency.remove(&entry.touched);
        true
      }
      None => false,
    }
  }

  /// Drop every expired entry, returning how many went.
  fn purge_expired(&mut self, now: DateTime<Utc>) -> u64 {
    let expired: Vec<String> = self
      .map
      .iter()
      .filter(|(_, e)| !e.is_valid(now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    expired.len() as u64
  }

  fn pop_least_recent(&mut self) -> Option<String> {
    let (_, key) = self.recency.pop_first()?;
    self.map.remove(&key);
    Some(key)
  }
}

#[derive(Debug, Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  expirations: AtomicU64,
  evictions: AtomicU64,
}

/// Process-local key/value store with lazy TTL expiry.
///
/// Values are held as JSON so one store can serve every query type. All
/// operations are total: a value that cannot be serialised is not stored and
/// a value that does not decode as the requested type reads as absent.
///
/// The store is bounded. When an insert pushes it past capacity, expired
/// entries are purged first and then least recently used entries are evicted.
pub struct CacheStore {
  entries: Mutex<Entries>,
  counters: Counters,
  default_ttl: Duration,
  capacity: usize,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  /// Create a store on the wall clock with default TTL and capacity.
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(Entries::default()),
      counters: Counters::default(),
      default_ttl: DEFAULT_TTL,
      capacity: DEFAULT_CAPACITY,
      clock,
    }
  }

  /// Set the TTL used by `set` when none is given. Must be non-zero.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Result<Self> {
    if ttl.is_zero() {
      return Err(eyre!("Default cache TTL must be greater than zero"));
    }
    self.default_ttl = ttl;
    Ok(self)
  }

  /// Set the maximum number of entries. Must be non-zero.
  pub fn with_capacity(mut self, capacity: usize) -> Result<Self> {
    if capacity == 0 {
      return Err(eyre!("Cache capacity must be greater than zero"));
    }
    self.capacity = capacity;
    Ok(self)
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  fn lock(&self) -> MutexGuard<'_, Entries> {
    // Entries stay consistent across a panic in another holder, so keep going.
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Get an unexpired value.
  pub fn get<T: Cacheable>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|c| c.value)
  }

  /// Get an unexpired value along with its write time.
  pub fn get_entry<T: Cacheable>(&self, key: &str) -> Option<CachedValue<T>> {
    let now = self.clock.now();
    let mut entries = self.lock();

    let valid = match entries.map.get(key) {
      Some(entry) => entry.is_valid(now),
      None => {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    };

    if !valid {
      entries.remove(key);
      self.counters.expirations.fetch_add(1, Ordering::Relaxed);
      self.counters.misses.fetch_add(1, Ordering::Relaxed);
      debug!(key, "cache entry expired");
      return None;
    }

    entries.touch(key);
    let entry = entries.map.get(key)?;
    match serde_json::from_value::<T>(entry.value.clone()) {
      Ok(value) => {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(CachedValue {
          value,
          stored_at: entry.stored_at,
          ttl: entry.ttl,
        })
      }
      Err(e) => {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, error = %e, "cached value does not match requested type");
        None
      }
    }
  }

  /// Store a value, replacing any existing entry. `None` uses the default TTL.
  pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    let json = match serde_json::to_value(value) {
      Ok(json) => json,
      Err(e) => {
        warn!(key, error = %e, "failed to serialise value, not caching");
        return;
      }
    };

    let now = self.clock.now();
    let ttl = ttl.unwrap_or(self.default_ttl);
    let mut entries = self.lock();
    entries.insert(key.to_string(), json, now, ttl);

    if entries.map.len() > self.capacity {
      let purged = entries.purge_expired(now);
      self
        .counters
        .expirations
        .fetch_add(purged, Ordering::Relaxed);
    }
    while entries.map.len() > self.capacity {
      match entries.pop_least_recent() {
        Some(evicted) => {
          self.counters.evictions.fetch_add(1, Ordering::Relaxed);
          debug!(key = %evicted, "evicted least recently used cache entry");
        }
        None => break,
      }
    }
  }

  /// Remove one entry. Returns whether it existed.
  pub fn invalidate(&self, key: &str) -> bool {
    self.lock().remove(key)
  }

  /// Remove every entry whose key starts with `prefix`. Returns how many.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let mut entries = self.lock();
    let keys: Vec<String> = entries
      .map
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    for key in &keys {
      entries.remove(key);
    }
    keys.len()
  }

  pub fn clear(&self) {
    let mut entries = self.lock();
    entries.map.clear();
    entries.recency.clear();
  }

  /// Number of stored entries, including expired ones not yet read.
  pub fn len(&self) -> usize {
    self.lock().map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits: self.counters.hits.load(Ordering::Relaxed),
      misses: self.counters.misses.load(Ordering::Relaxed),
      expirations: self.counters.expirations.load(Ordering::Relaxed),
      evictions: self.counters.evictions.load(Ordering::Relaxed),
      entries: self.len(),
    }
  }
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("default_ttl", &self.default_ttl)
      .field("capacity", &self.capacity)
      .field("len", &self.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn store() -> (Arc<ManualClock>, CacheStore) {
    let clock = Arc::new(ManualClock::default());
    let store = CacheStore::with_clock(clock.clone());
    (clock, store)
  }

  #[test]
  fn test_get_returns_stored_value() {
    let (_, store) = store();
    store.set("posts", &vec![1, 2], None);
    assert_eq!(store.get::<Vec<i32>>("posts"), Some(vec![1, 2]));
    assert_eq!(store.get::<Vec<i32>>("missing"), None);
  }

  #[test]
  fn test_ttl_boundary() {
    let (clock, store) = store();
    store.set("k", &"v".to_string(), Some(Duration::from_secs(60)));

    clock.advance(Duration::from_millis(59_999));
    assert_eq!(store.get::<String>("k"), Some("v".to_string()));

    clock.advance(Duration::from_millis(2));
    assert_eq!(store.get::<String>("k"), None);
    // Lazy expiry removes the entry on access
    assert_eq!(store.len(), 0);
    assert_eq!(store.stats().expirations, 1);
  }

  #[test]
  fn test_expires_exactly_at_ttl() {
    let (clock, store) = store();
    store.set("k", &1u32, Some(Duration::from_secs(10)));
    clock.advance(Duration::from_secs(10));
    assert_eq!(store.get::<u32>("k"), None);
  }

  #[test]
  fn test_default_ttl_applies() {
    let clock = Arc::new(ManualClock::default());
    let store = CacheStore::with_clock(clock.clone())
      .with_default_ttl(Duration::from_secs(5))
      .unwrap();
    store.set("k", &1u32, None);
    clock.advance(Duration::from_secs(4));
    assert_eq!(store.get::<u32>("k"), Some(1));
    clock.advance(Duration::from_secs(2));
    assert_eq!(store.get::<u32>("k"), None);
  }

  #[test]
  fn test_set_overwrites_and_resets_stored_at() {
    let (clock, store) = store();
    store.set("k", &1u32, Some(Duration::from_secs(10)));
    clock.advance(Duration::from_secs(8));
    store.set("k", &2u32, Some(Duration::from_secs(10)));
    clock.advance(Duration::from_secs(8));

    let entry = store.get_entry::<u32>("k").unwrap();
    assert_eq!(entry.value, 2);
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_entry_reports_stored_at() {
    let (clock, store) = store();
    let t0 = clock.now();
    store.set("k", &1u32, None);
    clock.advance(Duration::from_secs(30));
    assert_eq!(store.get_entry::<u32>("k").unwrap().stored_at, t0);
  }

  #[test]
  fn test_wrong_type_reads_as_absent() {
    let (_, store) = store();
    store.set("k", &"text".to_string(), None);
    assert_eq!(store.get::<u64>("k"), None);
    assert_eq!(store.get::<String>("k"), Some("text".to_string()));
  }

  #[test]
  fn test_invalidate_and_clear() {
    let (_, store) = store();
    store.set("posts:a", &1u32, None);
    store.set("posts:b", &2u32, None);
    store.set("services:a", &3u32, None);

    assert!(store.invalidate("posts:a"));
    assert!(!store.invalidate("posts:a"));
    assert_eq!(store.invalidate_prefix("posts:"), 1);
    assert_eq!(store.len(), 1);

    store.clear();
    assert!(store.is_empty());
  }

  #[test]
  fn test_lru_eviction_prefers_least_recently_used() {
    let clock = Arc::new(ManualClock::default());
    let store = CacheStore::with_clock(clock).with_capacity(2).unwrap();
    store.set("a", &1u32, None);
    store.set("b", &2u32, None);
    // Touch "a" so "b" becomes least recently used
    assert_eq!(store.get::<u32>("a"), Some(1));
    store.set("c", &3u32, None);

    assert_eq!(store.len(), 2);
    assert_eq!(store.get::<u32>("a"), Some(1));
    assert_eq!(store.get::<u32>("b"), None);
    assert_eq!(store.get::<u32>("c"), Some(3));
    assert_eq!(store.stats().evictions, 1);
  }

  #[test]
  fn test_expired_entries_purged_before_eviction() {
    let clock = Arc::new(ManualClock::default());
    let store = CacheStore::with_clock(clock.clone()).with_capacity(2).unwrap();
    store.set("short", &1u32, Some(Duration::from_secs(1)));
    store.set("long", &2u32, Some(Duration::from_secs(100)));
    clock.advance(Duration::from_secs(2));
    store.set("new", &3u32, None);

    assert_eq!(store.get::<u32>("long"), Some(2));
    assert_eq!(store.get::<u32>("new"), Some(3));
    let stats = store.stats();
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.expirations, 1);
  }

  #[test]
  fn test_stats_count_hits_and_misses() {
    let (_, store) = store();
    store.set("k", &1u32, None);
    store.get::<u32>("k");
    store.get::<u32>("k");
    store.get::<u32>("nope");

    let stats = store.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
  }

  #[test]
  fn test_zero_ttl_and_capacity_are_rejected() {
    assert!(CacheStore::new().with_default_ttl(Duration::ZERO).is_err());
    assert!(CacheStore::new().with_capacity(0).is_err());

    let store = CacheStore::new()
      .with_default_ttl(Duration::from_secs(1))
      .and_then(|s| s.with_capacity(3))
      .unwrap();
    assert_eq!(store.default_ttl(), Duration::from_secs(1));
    assert_eq!(store.capacity(), 3);
  }
}
