use async_trait::async_trait;

use crate::entry::StoredEntry;
use crate::error::CacheError;

/// A store is a common interface for storing, reading and deleting entries
/// in one cache tier.
///
/// Keys are fully qualified backing-store keys (prefix and schema version
/// already applied). The store implementation is responsible for never
/// returning an entry past its `stale_until`.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for metrics/tracing.
    ///
    /// # Example
    /// - "moka"
    /// - "remote"
    fn name(&self) -> &'static str;

    /// Return the cached entry.
    ///
    /// The response must be `None` for cache misses.
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError>;

    /// Sets the entry for the given key.
    ///
    /// Use `entry.stale_until` (unix milli timestamp) to configure expiration.
    async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError>;

    /// Removes the key(s) from the store.
    async fn remove(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Removes every key matching a Redis-style glob.
    ///
    /// Returns how many keys were removed, or 0 for tiers that cannot count
    /// them (or cannot scan at all).
    async fn remove_matching(&self, _pattern: &str) -> Result<u64, CacheError> {
        Ok(0)
    }
}
