use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::connection::HealthReport;
use crate::error::CacheError;

/// Wire-level primitives the distributed tier and the tag index need from
/// the backing store.
///
/// Any key-value technology offering GET / SET-with-TTL / DEL / EXISTS / TTL /
/// pattern scan and set membership satisfies this trait. Keys are fully
/// qualified; implementations never add their own prefix.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A name for metrics/tracing.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Store `value` and let the backend evict it after `ttl`.
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining time to live. `None` if the key is missing or has no expiry.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// All keys matching a Redis-style glob. Walks the whole keyspace.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Add `member` to the set at `key` and make sure the set lives at least
    /// `ttl`. The set's expiry is only ever extended, never shortened.
    async fn tag_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Members of the set at `key`; empty when the set does not exist.
    async fn tag_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Liveness check plus node metadata.
    async fn check_health(&self) -> HealthReport;
}
