//! Fallback layer that resolves a read through live, cache, local and default tiers.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::store::CacheStore;
use super::traits::{Cacheable, FetchResult, QueryKey};
use crate::dataset::StaticDataset;

type Operation<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// Observer for live failures that were absorbed by a lower tier.
pub type ErrorHook = Arc<dyn Fn(&Report) + Send + Sync>;

/// One logical read, ready to be resolved.
///
/// Built through [`FetchRequest::builder`], which rejects malformed
/// configuration before anything runs.
pub struct FetchRequest<T> {
  operation: Operation<T>,
  fallback: Option<T>,
  cache_key: Option<String>,
  cache_ttl: Option<Duration>,
  local_key: Option<String>,
  on_error: Option<ErrorHook>,
  description: Option<String>,
}

impl<T: Cacheable> FetchRequest<T> {
  /// Start building a request around a live operation.
  pub fn builder<F, Fut>(operation: F) -> FetchRequestBuilder<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    FetchRequestBuilder {
      operation: Box::new(move || operation().boxed()),
      fallback: None,
      cache_key: None,
      cache_ttl: None,
      local_key: None,
      on_error: None,
      timeout: None,
      description: None,
    }
  }

  pub fn cache_key(&self) -> Option<&str> {
    self.cache_key.as_deref()
  }

  pub fn local_key(&self) -> Option<&str> {
    self.local_key.as_deref()
  }
}

impl<T> std::fmt::Debug for FetchRequest<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FetchRequest")
      .field("cache_key", &self.cache_key)
      .field("cache_ttl", &self.cache_ttl)
      .field("local_key", &self.local_key)
      .field("has_fallback", &self.fallback.is_some())
      .field("description", &self.description)
      .finish_non_exhaustive()
  }
}

/// Builder for [`FetchRequest`].
pub struct FetchRequestBuilder<T> {
  operation: Operation<T>,
  fallback: Option<T>,
  cache_key: Option<String>,
  cache_ttl: Option<Duration>,
  local_key: Option<String>,
  on_error: Option<ErrorHook>,
  timeout: Option<Duration>,
  description: Option<String>,
}

impl<T: Cacheable> FetchRequestBuilder<T> {
  /// Value returned when every other tier misses.
  pub fn fallback(mut self, data: T) -> Self {
    self.fallback = Some(data);
    self
  }

  /// Cache key for write-through on success and lookup on failure.
  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  /// TTL for the write-through entry. Requires a cache key.
  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  /// Logical key into the static dataset.
  pub fn local_key(mut self, key: impl Into<String>) -> Self {
    self.local_key = Some(key.into());
    self
  }

  /// Take cache key, static mapping and description from a typed key.
  pub fn key(mut self, key: &impl QueryKey) -> Self {
    self.cache_key = Some(key.cache_hash());
    self.local_key = key.local_key();
    self.description = Some(key.description());
    self
  }

  /// Called with every live failure, whether or not a lower tier recovers.
  pub fn on_error<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Report) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(hook));
    self
  }

  /// Fail the live operation if it has not finished within `limit`.
  pub fn timeout(mut self, limit: Duration) -> Self {
    self.timeout = Some(limit);
    self
  }

  pub fn describe(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  /// Validate and produce the request.
  pub fn build(self) -> Result<FetchRequest<T>> {
    if matches!(self.cache_key.as_deref(), Some("")) {
      return Err(eyre!("Cache key must not be empty"));
    }
    if let Some(ttl) = self.cache_ttl {
      if ttl.is_zero() {
        return Err(eyre!("Cache TTL must be greater than zero"));
      }
      if self.cache_key.is_none() {
        return Err(eyre!("Cache TTL given without a cache key"));
      }
    }
    if matches!(self.timeout, Some(t) if t.is_zero()) {
      return Err(eyre!("Live operation timeout must be greater than zero"));
    }

    let operation = match self.timeout {
      Some(limit) => with_timeout(self.operation, limit),
      None => self.operation,
    };

    Ok(FetchRequest {
      operation,
      fallback: self.fallback,
      cache_key: self.cache_key,
      cache_ttl: self.cache_ttl,
      local_key: self.local_key,
      on_error: self.on_error,
      description: self.description,
    })
  }
}

/// Wrap an operation so that it fails once `limit` elapses. The timeout is
/// part of the live call, so the fallback chain sees an ordinary failure.
fn with_timeout<T: Send + 'static>(operation: Operation<T>, limit: Duration) -> Operation<T> {
  Box::new(move || {
    async move {
      match tokio::time::timeout(limit, operation()).await {
        Ok(result) => result,
        Err(_) => Err(eyre!("Live operation timed out after {:?}", limit)),
      }
    }
    .boxed()
  })
}

/// Resolves reads with a fixed tier order: live, cache, local, default.
///
/// Live successes are written through to the cache. Failures fall one tier
/// at a time and are never surfaced unless every tier misses, in which case
/// the live error is returned as is.
#[derive(Clone)]
pub struct FallbackLayer {
  cache: Arc<CacheStore>,
  dataset: Arc<StaticDataset>,
}

impl FallbackLayer {
  pub fn new(cache: Arc<CacheStore>, dataset: Arc<StaticDataset>) -> Self {
    Self { cache, dataset }
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn dataset(&self) -> &Arc<StaticDataset> {
    &self.dataset
  }

  /// Run one request through the tiers.
  pub async fn resolve<T: Cacheable>(&self, request: FetchRequest<T>) -> Result<FetchResult<T>> {
    let FetchRequest {
      operation,
      fallback,
      cache_key,
      cache_ttl,
      local_key,
      on_error,
      description,
    } = request;
    let label = description
      .as_deref()
      .or(cache_key.as_deref())
      .unwrap_or("query");

    let error = match operation().await {
      Ok(data) => {
        if let Some(key) = &cache_key {
          self.cache.set(key, &data, cache_ttl);
        }
        debug!(query = label, "served from live source");
        return Ok(FetchResult::live(data, self.cache.clock().now()));
      }
      Err(error) => error,
    };

    warn!(query = label, error = %error, "live fetch failed, falling back");
    if let Some(hook) = &on_error {
      hook(&error);
    }

    if let Some(key) = &cache_key {
      if let Some(cached) = self.cache.get_entry::<T>(key) {
        debug!(query = label, stored_at = %cached.stored_at, "served from cache");
        return Ok(FetchResult::cached(cached.value, cached.stored_at));
      }
    }

    if let Some(key) = &local_key {
      if let Some(data) = self.dataset.lookup::<T>(key) {
        debug!(query = label, local_key = %key, "served from fallback dataset");
        return Ok(FetchResult::local(data, self.cache.clock().now()));
      }
    }

    if let Some(data) = fallback {
      debug!(query = label, "served caller default");
      return Ok(FetchResult::default_data(data, self.cache.clock().now()));
    }

    Err(error)
  }
}

impl std::fmt::Debug for FallbackLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FallbackLayer")
      .field("cache", &self.cache)
      .field("dataset_keys", &self.dataset.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Source;
  use crate::clock::{Clock, ManualClock};
  use std::io;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn network_error() -> Report {
    Report::new(io::Error::new(io::ErrorKind::ConnectionRefused, "network down"))
  }

  fn layer_with(dataset: StaticDataset) -> (Arc<ManualClock>, FallbackLayer) {
    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(CacheStore::with_clock(clock.clone()));
    (clock, FallbackLayer::new(cache, Arc::new(dataset)))
  }

  fn layer() -> (Arc<ManualClock>, FallbackLayer) {
    layer_with(StaticDataset::empty())
  }

  fn ok<T: Cacheable>(value: T) -> FetchRequestBuilder<T> {
    FetchRequest::builder(move || async move { Ok(value) })
  }

  fn failing<T: Cacheable>() -> FetchRequestBuilder<T> {
    FetchRequest::builder(|| async { Err(network_error()) })
  }

  #[tokio::test]
  async fn test_live_success_wins_over_every_other_tier() {
    let dataset = StaticDataset::empty().with_entry("posts", &vec![9]).unwrap();
    let (_, layer) = layer_with(dataset);
    layer.cache().set("posts", &vec![8], None);

    let request = ok(vec![1, 2])
      .cache_key("posts")
      .local_key("posts")
      .fallback(vec![7])
      .build()
      .unwrap();
    let result = layer.resolve(request).await.unwrap();

    assert_eq!(result.source, Source::Live);
    assert_eq!(result.data, vec![1, 2]);
  }

  #[tokio::test]
  async fn test_live_success_writes_through() {
    let (_, layer) = layer();
    for value in [1u32, 2, 3] {
      let request = ok(value).cache_key("n").build().unwrap();
      layer.resolve(request).await.unwrap();
      assert_eq!(layer.cache().get::<u32>("n"), Some(value));
    }
  }

  #[tokio::test]
  async fn test_write_through_uses_request_ttl() {
    let (clock, layer) = layer();
    let request = ok(1u32)
      .cache_key("n")
      .cache_ttl(Duration::from_secs(10))
      .build()
      .unwrap();
    layer.resolve(request).await.unwrap();

    clock.advance(Duration::from_secs(11));
    assert_eq!(layer.cache().get::<u32>("n"), None);
  }

  #[tokio::test]
  async fn test_empty_live_result_is_not_a_fallback() {
    let (_, layer) = layer();
    let request = ok(Vec::<u32>::new())
      .cache_key("posts")
      .fallback(vec![1])
      .build()
      .unwrap();
    let result = layer.resolve(request).await.unwrap();

    assert_eq!(result.source, Source::Live);
    assert!(result.data.is_empty());
  }

  #[tokio::test]
  async fn test_unexpired_cache_serves_failure() {
    let (clock, layer) = layer();
    let t0 = clock.now();
    layer
      .cache()
      .set("posts", &vec!["p1", "p2"], Some(Duration::from_secs(60)));
    clock.advance(Duration::from_secs(30));

    let request = failing::<Vec<String>>().cache_key("posts").build().unwrap();
    let result = layer.resolve(request).await.unwrap();

    assert_eq!(result.source, Source::Cache);
    assert_eq!(result.data, vec!["p1".to_string(), "p2".to_string()]);
    assert_eq!(result.timestamp, t0);
  }

  #[tokio::test]
  async fn test_expired_cache_falls_to_default() {
    let (clock, layer) = layer();
    layer
      .cache()
      .set("posts", &vec!["p1", "p2"], Some(Duration::from_secs(60)));
    clock.advance(Duration::from_secs(90));

    let request = failing::<Vec<String>>()
      .cache_key("posts")
      .fallback(Vec::new())
      .build()
      .unwrap();
    let result = layer.resolve(request).await.unwrap();

    assert_eq!(result.source, Source::Default);
    assert!(result.data.is_empty());
  }

  #[tokio::test]
  async fn test_cache_miss_falls_to_local() {
    let dataset = StaticDataset::empty()
      .with_entry("posts-by-service:ai", &vec![5u32])
      .unwrap();
    let (_, layer) = layer_with(dataset);

    let request = failing::<Vec<u32>>()
      .cache_key("missing")
      .local_key("posts-by-service:ai")
      .fallback(vec![1])
      .build()
      .unwrap();
    let result = layer.resolve(request).await.unwrap();

    assert_eq!(result.source, Source::Local);
    assert_eq!(result.data, vec![5]);
  }

  #[tokio::test]
  async fn test_unmapped_local_key_is_a_miss() {
    let (_, layer) = layer_with(StaticDataset::bundled().unwrap());
    let request = failing::<Vec<u32>>()
      .local_key("posts-by-service:unknown")
      .fallback(vec![1])
      .build()
      .unwrap();
    let result = layer.resolve(request).await.unwrap();
    assert_eq!(result.source, Source::Default);
  }

  #[tokio::test]
  async fn test_total_failure_returns_original_error() {
    let (_, layer) = layer();
    let request = failing::<Vec<u32>>().cache_key("missing").build().unwrap();
    let err = layer.resolve(request).await.unwrap_err();

    let io_err = err.downcast_ref::<io::Error>().expect("original error type");
    assert_eq!(io_err.kind(), io::ErrorKind::ConnectionRefused);
    assert_eq!(err.to_string(), "network down");
  }

  #[tokio::test]
  async fn test_on_error_sees_absorbed_failures() {
    let (_, layer) = layer();
    let seen = Arc::new(AtomicU32::new(0));
    let seen_hook = seen.clone();

    let request = failing::<u32>()
      .fallback(0)
      .on_error(move |err| {
        assert_eq!(err.to_string(), "network down");
        seen_hook.fetch_add(1, Ordering::SeqCst);
      })
      .build()
      .unwrap();
    let result = layer.resolve(request).await.unwrap();

    assert_eq!(result.source, Source::Default);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_on_error_not_called_on_success() {
    let (_, layer) = layer();
    let seen = Arc::new(AtomicU32::new(0));
    let seen_hook = seen.clone();
    let request = ok(1u32)
      .on_error(move |_| {
        seen_hook.fetch_add(1, Ordering::SeqCst);
      })
      .build()
      .unwrap();
    layer.resolve(request).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_timeout_is_a_live_failure() {
    let (_, layer) = layer();
    let request = FetchRequest::builder(|| async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(1u32)
    })
    .timeout(Duration::from_millis(10))
    .fallback(0)
    .build()
    .unwrap();

    let result = layer.resolve(request).await.unwrap();
    assert_eq!(result.source, Source::Default);
  }

  #[test]
  fn test_build_rejects_bad_configuration() {
    assert!(ok(1u32).cache_key("k").cache_ttl(Duration::ZERO).build().is_err());
    assert!(ok(1u32).cache_ttl(Duration::from_secs(1)).build().is_err());
    assert!(ok(1u32).cache_key("").build().is_err());
    assert!(ok(1u32).timeout(Duration::ZERO).build().is_err());
    assert!(ok(1u32).cache_key("k").cache_ttl(Duration::from_secs(1)).build().is_ok());
  }

  #[test]
  fn test_key_sets_cache_and_local_keys() {
    struct Posts;
    impl QueryKey for Posts {
      fn canonical(&self) -> String {
        "posts".into()
      }
      fn description(&self) -> String {
        "all posts".into()
      }
      fn local_key(&self) -> Option<String> {
        Some("posts".into())
      }
      fn namespace(&self) -> &'static str {
        "posts"
      }
    }

    let request = ok(1u32).key(&Posts).build().unwrap();
    assert_eq!(request.cache_key(), Some(Posts.cache_hash().as_str()));
    assert_eq!(request.local_key(), Some("posts"));
  }
}
