//! Query keys for content reads.

use crate::cache::QueryKey;

/// Namespace shared by every post query, invalidated after post writes.
pub const POSTS_NAMESPACE: &str = "posts";

/// Namespace for service queries.
pub const SERVICES_NAMESPACE: &str = "services";

/// Query key types for content reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentQueryKey {
  /// Every post
  Posts,
  /// Posts belonging to one service
  PostsByService { service: String },
  /// A single post
  Post { id: i64 },
  /// Every service
  Services,
}

impl QueryKey for ContentQueryKey {
  fn canonical(&self) -> String {
    match self {
      Self::Posts => "posts".to_string(),
      Self::PostsByService { service } => format!("posts_by_service:{}", normalize_slug(service)),
      Self::Post { id } => format!("post:{}", id),
      Self::Services => "services".to_string(),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Posts => "all posts".to_string(),
      Self::PostsByService { service } => format!("posts for service {}", service),
      Self::Post { id } => format!("post {}", id),
      Self::Services => "all services".to_string(),
    }
  }

  /// Keys into the bundled snapshot. Single posts have no snapshot entry.
  fn local_key(&self) -> Option<String> {
    match self {
      Self::Posts => Some("posts".to_string()),
      Self::PostsByService { service } => {
        Some(format!("posts-by-service:{}", normalize_slug(service)))
      }
      Self::Post { .. } => None,
      Self::Services => Some("services".to_string()),
    }
  }

  fn namespace(&self) -> &'static str {
    match self {
      Self::Posts | Self::PostsByService { .. } | Self::Post { .. } => POSTS_NAMESPACE,
      Self::Services => SERVICES_NAMESPACE,
    }
  }
}

/// Normalize a service slug for consistent keys.
/// Trims whitespace and lowercases for case-insensitive matching.
pub(crate) fn normalize_slug(slug: &str) -> String {
  slug.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_service_keys_are_case_insensitive() {
    let a = ContentQueryKey::PostsByService {
      service: "AI ".to_string(),
    };
    let b = ContentQueryKey::PostsByService {
      service: "ai".to_string(),
    };
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.local_key().as_deref(), Some("posts-by-service:ai"));
  }

  #[test]
  fn test_cache_and_local_keys_differ() {
    let key = ContentQueryKey::Posts;
    assert_ne!(Some(key.cache_hash()), key.local_key());
    assert!(key.cache_hash().starts_with("posts:"));
  }

  #[test]
  fn test_single_post_has_no_local_mapping() {
    assert_eq!(ContentQueryKey::Post { id: 1 }.local_key(), None);
  }

  #[test]
  fn test_namespaces() {
    assert!(ContentQueryKey::Post { id: 1 }
      .cache_hash()
      .starts_with("posts:"));
    assert!(ContentQueryKey::Services
      .cache_hash()
      .starts_with("services:"));
  }
}
