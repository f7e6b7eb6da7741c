//! Posts and services: the content the platform serves.

pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cached_client::CachedContentClient;
pub use client::ContentClient;
pub use types::{NewPost, Post, Service};
