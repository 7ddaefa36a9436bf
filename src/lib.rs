//! tiered-swr-cache - a two-tier stale-while-revalidate cache for Rust
//!
//! This library provides:
//! - A bounded in-process tier (Moka) in front of a distributed tier (Redis)
//! - Stale-while-revalidate reads with detached background refresh
//! - Deduplication of concurrent origin fetches per key
//! - Tag and pattern based group invalidation
//! - A Redis connection manager that follows sentinel failover
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tiered_swr_cache::{CacheBuilder, ConnectionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tiered_swr_cache::CacheError> {
//!     let cache = CacheBuilder::from_env()
//!         .connect_redis(ConnectionConfig::from_env()?)
//!         .await?;
//!
//!     // Read-through with the default policy (300s fresh, 60s stale window)
//!     let policy = cache.policy().with_tags(["org:7"]);
//!     let title: String = cache
//!         .get_or_set("meeting:42", |key| async move {
//!             // Load from the database - `key` is "meeting:42"
//!             Ok::<_, std::io::Error>(format!("title of {}", key))
//!         }, &policy)
//!         .await?;
//!
//!     // Drop everything filed under the organisation
//!     cache.invalidate_tag("org:7").await?;
//!     Ok(())
//! }
//! ```

mod backend;
mod builder;
mod cache;
pub mod connection;
mod dedup;
mod entry;
mod error;
mod events;
mod invalidation;
mod store;
pub mod stores;
mod swr;
mod tiered;
mod utils;

// Re-export public API
pub use backend::Backend;
pub use builder::{CacheBuilder, CacheConfig};
pub use cache::Cache;
pub use connection::{
    ConnectionConfig, ConnectionHealth, ConnectionManager, Endpoint, HealthReport, NodeInfo,
    NodeRole, RetryPolicy,
};
pub use dedup::RequestDeduplicator;
pub use entry::{Entry, Freshness, StoredEntry};
pub use error::CacheError;
pub use events::{
    CacheEvent, CacheStats, ConnectionState, EventSink, FanoutSink, NoopSink, StatsSnapshot, Tier,
    TracingSink,
};
pub use invalidation::InvalidationIndex;
pub use store::Store;
pub use stores::memory::{MemoryBackend, MemoryBackendConfig};
pub use stores::metrics::MetricsStore;
pub use stores::moka::{MokaStore, MokaStoreConfig};
pub use stores::redis::RedisBackend;
pub use stores::remote::RemoteStore;
pub use swr::{CachePolicy, SwrCache};
pub use tiered::TieredStore;
pub use utils::KEY_SCHEMA_VERSION;
