//! Content client that resolves every read through the fallback layer.

use color_eyre::Result;
use std::time::Duration;
use tracing::debug;

use crate::cache::{Cacheable, FallbackLayer, FetchRequest, FetchRequestBuilder, FetchResult};
use crate::content::cache::{normalize_slug, ContentQueryKey, POSTS_NAMESPACE};
use crate::content::client::ContentClient;
use crate::content::types::{NewPost, Post, Service};

/// Content client with tiered fallback.
///
/// This wraps the underlying ContentClient and provides the same reads, but
/// every read is cached on success and served from cache, the bundled
/// snapshot or an empty default when the database cannot answer. Writes go
/// straight through and invalidate the affected cache namespace.
#[derive(Clone)]
pub struct CachedContentClient {
  inner: ContentClient,
  layer: FallbackLayer,
  cache_ttl: Duration,
  timeout: Option<Duration>,
}

impl CachedContentClient {
  pub fn new(inner: ContentClient, layer: FallbackLayer, cache_ttl: Duration) -> Self {
    Self {
      inner,
      layer,
      cache_ttl,
      timeout: None,
    }
  }

  /// Bound every live read by `timeout`.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn inner(&self) -> &ContentClient {
    &self.inner
  }

  pub fn layer(&self) -> &FallbackLayer {
    &self.layer
  }

  fn configure<T: Cacheable>(
    &self,
    key: &ContentQueryKey,
    builder: FetchRequestBuilder<T>,
  ) -> FetchRequestBuilder<T> {
    let builder = builder.key(key).cache_ttl(self.cache_ttl);
    match self.timeout {
      Some(limit) => builder.timeout(limit),
      None => builder,
    }
  }

  pub fn posts_request(&self) -> Result<FetchRequest<Vec<Post>>> {
    let inner = self.inner.clone();
    self
      .configure(
        &ContentQueryKey::Posts,
        FetchRequest::builder(move || async move { inner.list_posts().await }),
      )
      .fallback(Vec::new())
      .build()
  }

  /// The live query and the keys all use the normalized slug.
  pub fn posts_by_service_request(&self, service: &str) -> Result<FetchRequest<Vec<Post>>> {
    let inner = self.inner.clone();
    let service = normalize_slug(service);
    let key = ContentQueryKey::PostsByService {
      service: service.clone(),
    };
    self
      .configure(
        &key,
        FetchRequest::builder(move || async move { inner.posts_by_service(&service).await }),
      )
      .fallback(Vec::new())
      .build()
  }

  /// A single post has no snapshot entry and no sensible default, so total
  /// failure surfaces as an error.
  pub fn post_request(&self, id: i64) -> Result<FetchRequest<Post>> {
    let inner = self.inner.clone();
    self
      .configure(
        &ContentQueryKey::Post { id },
        FetchRequest::builder(move || async move { inner.get_post(id).await }),
      )
      .build()
  }

  pub fn services_request(&self) -> Result<FetchRequest<Vec<Service>>> {
    let inner = self.inner.clone();
    self
      .configure(
        &ContentQueryKey::Services,
        FetchRequest::builder(move || async move { inner.list_services().await }),
      )
      .fallback(Vec::new())
      .build()
  }

  pub async fn list_posts(&self) -> Result<FetchResult<Vec<Post>>> {
    self.layer.resolve(self.posts_request()?).await
  }

  pub async fn posts_by_service(&self, service: &str) -> Result<FetchResult<Vec<Post>>> {
    self
      .layer
      .resolve(self.posts_by_service_request(service)?)
      .await
  }

  pub async fn get_post(&self, id: i64) -> Result<FetchResult<Post>> {
    self.layer.resolve(self.post_request(id)?).await
  }

  pub async fn list_services(&self) -> Result<FetchResult<Vec<Service>>> {
    self.layer.resolve(self.services_request()?).await
  }

  /// Create a post (not cached - write operation). Drops every cached post
  /// query so the next read cannot serve a list without it.
  pub async fn create_post(&self, post: NewPost) -> Result<Post> {
    let created = self.inner.create_post(post).await?;
    let dropped = self
      .layer
      .cache()
      .invalidate_prefix(&format!("{}:", POSTS_NAMESPACE));
    debug!(id = created.id, dropped, "invalidated cached post queries");
    Ok(created)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, Source};
  use crate::dataset::StaticDataset;
  use crate::db::Database;
  use std::sync::Arc;

  fn client_with(dataset: StaticDataset) -> CachedContentClient {
    let inner = ContentClient::new(Database::open_in_memory().unwrap());
    let layer = FallbackLayer::new(Arc::new(CacheStore::new()), Arc::new(dataset));
    CachedContentClient::new(inner, layer, Duration::from_secs(60))
  }

  /// Break the live source. Renaming the tables keeps the connection healthy
  /// while every content query fails.
  async fn break_database(client: &CachedContentClient) {
    client
      .inner()
      .execute_batch(
        "ALTER TABLE posts RENAME TO posts_gone;
         ALTER TABLE services RENAME TO services_gone;",
      )
      .await
      .unwrap();
  }

  fn ai_service() -> Service {
    Service {
      slug: "ai".to_string(),
      name: "AI".to_string(),
      description: String::new(),
    }
  }

  fn new_post(slug: &str) -> NewPost {
    NewPost {
      title: slug.to_string(),
      slug: slug.to_string(),
      excerpt: String::new(),
      service: "ai".to_string(),
      author: "tester".to_string(),
    }
  }

  #[tokio::test]
  async fn test_live_read_is_cached() {
    let client = client_with(StaticDataset::empty());
    client.inner().seed(vec![ai_service()], Vec::new()).await.unwrap();

    let result = client.list_services().await.unwrap();
    assert_eq!(result.source, Source::Live);
    assert_eq!(client.layer().cache().len(), 1);

    break_database(&client).await;
    let result = client.list_services().await.unwrap();
    assert_eq!(result.source, Source::Cache);
    assert_eq!(result.data, vec![ai_service()]);
  }

  #[tokio::test]
  async fn test_broken_database_uses_snapshot() {
    let client = client_with(StaticDataset::bundled().unwrap());
    break_database(&client).await;

    let result = client.posts_by_service("ai").await.unwrap();
    assert_eq!(result.source, Source::Local);
    assert!(result.data.iter().all(|p| p.service == "ai"));
  }

  #[tokio::test]
  async fn test_broken_database_without_snapshot_uses_empty_default() {
    let client = client_with(StaticDataset::empty());
    break_database(&client).await;

    let result = client.list_posts().await.unwrap();
    assert_eq!(result.source, Source::Default);
    assert!(result.data.is_empty());
  }

  #[tokio::test]
  async fn test_single_post_total_failure_is_error() {
    let client = client_with(StaticDataset::bundled().unwrap());
    break_database(&client).await;
    assert!(client.get_post(1).await.is_err());
  }

  #[tokio::test]
  async fn test_create_post_invalidates_post_queries() {
    let client = client_with(StaticDataset::empty());
    client.inner().seed(vec![ai_service()], Vec::new()).await.unwrap();

    client.list_posts().await.unwrap();
    client.posts_by_service("ai").await.unwrap();
    client.list_services().await.unwrap();
    assert_eq!(client.layer().cache().len(), 3);

    client.create_post(new_post("fresh")).await.unwrap();
    // Only the services entry survives
    assert_eq!(client.layer().cache().len(), 1);

    let posts = client.list_posts().await.unwrap();
    assert_eq!(posts.source, Source::Live);
    assert_eq!(posts.data.len(), 1);
  }

  #[tokio::test]
  async fn test_service_slug_case_shares_rows_and_cache_entry() {
    let client = client_with(StaticDataset::empty());
    client.inner().seed(vec![ai_service()], Vec::new()).await.unwrap();
    client.create_post(new_post("lowercase")).await.unwrap();

    let lower = client.posts_by_service("ai").await.unwrap();
    assert_eq!(lower.data.len(), 1);
    let upper = client.posts_by_service(" AI ").await.unwrap();
    assert_eq!(upper.source, Source::Live);
    assert_eq!(upper.data, lower.data);
    assert_eq!(client.layer().cache().len(), 1);

    break_database(&client).await;
    let cached = client.posts_by_service("ai").await.unwrap();
    assert_eq!(cached.source, Source::Cache);
    assert_eq!(cached.data.len(), 1);
  }
}
