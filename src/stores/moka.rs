use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::time::{Duration, Instant};

use crate::entry::StoredEntry;
use crate::error::CacheError;
use crate::store::Store;
use crate::utils::{glob_match, now_ms};

/// Configuration for MokaStore.
#[derive(Debug, Clone)]
pub struct MokaStoreConfig {
    /// Maximum number of entries the cache can hold.
    pub max_capacity: u64,

    /// Upper bound on how long any entry is held locally, regardless of its
    /// own `stale_until`. `None` lets entries live until `stale_until`.
    pub time_to_live: Option<Duration>,
}

impl Default for MokaStoreConfig {
    fn default() -> Self {
        MokaStoreConfig {
            max_capacity: 10_000,
            time_to_live: None,
        }
    }
}

impl MokaStoreConfig {
    /// Read `CACHE_L1_MAX_ENTRIES` and `CACHE_L1_MAX_TTL_SECS`, falling back
    /// to the defaults for missing or malformed values.
    pub fn from_env() -> Self {
        let defaults = MokaStoreConfig::default();
        let max_capacity = std::env::var("CACHE_L1_MAX_ENTRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_capacity);
        let time_to_live = std::env::var("CACHE_L1_MAX_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);
        MokaStoreConfig {
            max_capacity,
            time_to_live,
        }
    }
}

/// Evicts each entry at its own `stale_until`, optionally capped.
struct StaleExpiry {
    cap: Option<Duration>,
}

impl StaleExpiry {
    fn ttl_for(&self, entry: &StoredEntry) -> Option<Duration> {
        let left = entry.remaining_ttl(now_ms()).unwrap_or(Duration::ZERO);
        Some(match self.cap {
            Some(cap) => left.min(cap),
            None => left,
        })
    }
}

impl Expiry<String, StoredEntry> for StaleExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        self.ttl_for(value)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.ttl_for(value)
    }
}

/// Process-local L1 tier backed by Moka.
///
/// - Bounded by entry count with least-recently-used eviction
/// - Entries expire at their own `stale_until`
/// - Holds the same opaque payload bytes as the distributed tier, so a hit
///   here deserializes exactly like a hit there
pub struct MokaStore {
    cache: Cache<String, StoredEntry>,
}

impl MokaStore {
    /// Create a new MokaStore with the given configuration.
    ///
    /// # Example
    /// ```ignore
    /// let store = MokaStore::new(MokaStoreConfig {
    ///     max_capacity: 50_000,
    ///     time_to_live: Some(Duration::from_secs(30)),
    /// });
    /// ```
    pub fn new(config: MokaStoreConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(StaleExpiry {
                cap: config.time_to_live,
            })
            .support_invalidation_closures()
            .build();

        MokaStore { cache }
    }

    /// Get cache statistics (entry count, weighted size).
    ///
    /// Moka updates these lazily; call [`MokaStore::sync`] first for exact numbers.
    pub fn stats(&self) -> (u64, u64) {
        (self.cache.entry_count(), self.cache.weighted_size())
    }

    /// Run pending housekeeping (evictions, expirations, invalidations).
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl Store for MokaStore {
    fn name(&self) -> &'static str {
        "moka"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        match self.cache.get(key).await {
            Some(entry) if entry.is_expired(now_ms()) => {
                self.cache.invalidate(key).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        if entry.is_expired(now_ms()) {
            self.cache.invalidate(key).await;
            return Ok(());
        }
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }

    /// Matching entries are invalidated lazily by moka, so no count is known.
    async fn remove_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let pattern = pattern.to_string();
        self.cache
            .invalidate_entries_if(move |key, _| glob_match(&pattern, key))
            .map(|_| 0)
            .map_err(|e| CacheError::operation(self.name(), "*", e.to_string()))
    }
}
