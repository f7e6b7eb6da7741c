use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published article
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
  pub id: i64,
  pub title: String,
  pub slug: String,
  pub excerpt: String,
  /// Slug of the service this post belongs to
  pub service: String,
  pub author: String,
  pub published_at: DateTime<Utc>,
}

/// An academic service offered on the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
  pub slug: String,
  pub name: String,
  pub description: String,
}

/// Fields for a post about to be written
#[derive(Debug, Clone)]
pub struct NewPost {
  pub title: String,
  pub slug: String,
  pub excerpt: String,
  pub service: String,
  pub author: String,
}
