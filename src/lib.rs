//! Resilient tiered data access.
//!
//! Reads go to a live source first and degrade through a TTL cache, a bundled
//! static dataset and a caller default, with every result tagged by the tier
//! that served it. `Query` bindings keep that state for long-lived consumers
//! and heal themselves when connectivity returns.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connection;
pub mod content;
pub mod dataset;
pub mod db;
pub mod logging;
pub mod monitor;
pub mod query;

pub use cache::{CacheStore, FallbackLayer, FetchRequest, FetchResult, Source};
pub use connection::{ConnectionState, ConnectionWatcher, Transition};
pub use dataset::StaticDataset;
pub use query::{Query, QuerySnapshot, QueryStatus};
