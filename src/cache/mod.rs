//! Tiered caching layer for data access with offline support.
//!
//! This module provides a source-agnostic fallback mechanism that:
//! - Tries the live operation first and writes successes through to the cache
//! - Serves unexpired cache entries when the live operation fails
//! - Falls back to the bundled static dataset, then to a caller default
//! - Tags every result with the tier that produced it

mod layer;
mod store;
mod traits;

pub use layer::{ErrorHook, FallbackLayer, FetchRequest, FetchRequestBuilder};
pub use store::{CacheStats, CacheStore, CachedValue, DEFAULT_CAPACITY, DEFAULT_TTL};
pub use traits::{Cacheable, FetchResult, QueryKey, Source};
