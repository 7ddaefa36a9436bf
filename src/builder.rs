//! Explicit construction of a [`Cache`] instance.
//!
//! There is no global cache: build one per process (or per test) and pass it
//! to whatever needs it.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::cache::Cache;
use crate::connection::ConnectionConfig;
use crate::error::CacheError;
use crate::events::{CacheStats, EventSink, TracingSink};
use crate::invalidation::InvalidationIndex;
use crate::store::Store;
use crate::stores::metrics::MetricsStore;
use crate::stores::moka::{MokaStore, MokaStoreConfig};
use crate::stores::redis::RedisBackend;
use crate::stores::remote::RemoteStore;
use crate::swr::{CachePolicy, SwrCache};
use crate::tiered::TieredStore;

/// Cache-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// First segment of every backing-store key.
    pub key_prefix: String,
    /// Policy used by `get_or_set` when none is given.
    pub default_policy: CachePolicy,
    /// Return backing-store write and delete failures to the caller instead
    /// of only reporting them.
    pub strict_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            key_prefix: "app".to_string(),
            default_policy: CachePolicy::default(),
            strict_writes: false,
        }
    }
}

impl CacheConfig {
    /// Read `CACHE_KEY_PREFIX`, `CACHE_DEFAULT_TTL_SECS`,
    /// `CACHE_DEFAULT_SWR_SECS` and `CACHE_STRICT_WRITES`.
    pub fn from_env() -> Self {
        let mut config = CacheConfig::default();
        if let Ok(prefix) = env::var("CACHE_KEY_PREFIX")
            && !prefix.is_empty()
        {
            config.key_prefix = prefix;
        }
        if let Some(secs) = env::var("CACHE_DEFAULT_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.default_policy.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env::var("CACHE_DEFAULT_SWR_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.default_policy.swr_window = Duration::from_secs(secs);
        }
        if let Ok(strict) = env::var("CACHE_STRICT_WRITES") {
            config.strict_writes = matches!(strict.as_str(), "1" | "true" | "yes");
        }
        config
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_policy(mut self, policy: CachePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_strict_writes(mut self, strict: bool) -> Self {
        self.strict_writes = strict;
        self
    }
}

/// Builder for [`Cache`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tiered_swr_cache::{CacheBuilder, CacheConfig, ConnectionConfig};
///
/// let cache = CacheBuilder::new()
///     .config(CacheConfig::default().with_key_prefix("meetings"))
///     .connect_redis(ConnectionConfig::from_env()?)
///     .await?;
/// ```
pub struct CacheBuilder {
    config: CacheConfig,
    l1: Option<MokaStoreConfig>,
    events: Arc<dyn EventSink>,
    instrument_tiers: bool,
}

impl CacheBuilder {
    /// Create a new CacheBuilder with an L1 tier and tracing output.
    pub fn new() -> Self {
        CacheBuilder {
            config: CacheConfig::default(),
            l1: Some(MokaStoreConfig::default()),
            events: Arc::new(TracingSink),
            instrument_tiers: false,
        }
    }

    /// Take cache and L1 settings from the environment.
    pub fn from_env() -> Self {
        CacheBuilder::new()
            .config(CacheConfig::from_env())
            .l1(MokaStoreConfig::from_env())
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure the in-process tier.
    pub fn l1(mut self, config: MokaStoreConfig) -> Self {
        self.l1 = Some(config);
        self
    }

    /// Go straight to the distributed tier on every read.
    pub fn without_l1(mut self) -> Self {
        self.l1 = None;
        self
    }

    /// Where cache and connection events go. Defaults to [`TracingSink`].
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Report per-tier latency through the event sink.
    pub fn instrument_tiers(mut self, enabled: bool) -> Self {
        self.instrument_tiers = enabled;
        self
    }

    /// Build the cache on top of an existing backend.
    pub fn build(mut self, backend: Arc<dyn Backend>) -> Cache {
        let stats = Arc::new(CacheStats::default());

        let l1 = self.l1.take().map(|config| {
            let store: Arc<dyn Store> = Arc::new(MokaStore::new(config));
            self.instrument(store)
        });
        let l2 = self.instrument(Arc::new(RemoteStore::new(backend.clone())));

        let tiers = Arc::new(TieredStore::new(
            l1,
            l2,
            self.events.clone(),
            stats.clone(),
        ));
        let index = Arc::new(InvalidationIndex::new(
            self.config.key_prefix.clone(),
            backend.clone(),
            tiers.clone(),
            self.events.clone(),
        ));
        let swr = SwrCache::new(
            &self.config.key_prefix,
            tiers,
            index,
            self.events,
            stats,
        );

        tracing::debug!(
            prefix = %self.config.key_prefix,
            backend = backend.name(),
            "cache built"
        );
        Cache::new(swr, backend, self.config)
    }

    /// Connect to Redis (resolving the primary through sentinels when
    /// configured), start the health monitor and build the cache.
    pub async fn connect_redis(self, connection: ConnectionConfig) -> Result<Cache, CacheError> {
        let backend = RedisBackend::connect(connection, self.events.clone()).await?;
        // The monitor holds a weak reference and stops with the manager.
        let _ = backend.manager().spawn_health_monitor();
        Ok(self.build(Arc::new(backend)))
    }

    fn instrument(&self, store: Arc<dyn Store>) -> Arc<dyn Store> {
        if self.instrument_tiers {
            Arc::new(MetricsStore::new(store, self.events.clone()))
        } else {
            store
        }
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CacheEvent;
    use crate::events::testing::RecordingSink;
    use crate::stores::memory::MemoryBackend;

    #[tokio::test]
    async fn test_build_with_prefix() {
        let backend = Arc::new(MemoryBackend::default());
        let cache = CacheBuilder::new()
            .config(CacheConfig::default().with_key_prefix("meetings"))
            .build(backend.clone());

        cache
            .set("42", &"payload".to_string(), Duration::from_secs(60), &[])
            .await
            .unwrap();
        assert!(backend.exists("meetings:v1:d:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_without_l1_reads_backend() {
        let backend = Arc::new(MemoryBackend::default());
        let cache = CacheBuilder::new().without_l1().build(backend.clone());

        cache
            .set("k", &1u32, Duration::from_secs(60), &[])
            .await
            .unwrap();
        backend.del(&["app:v1:d:k".to_string()]).await.unwrap();

        // Nothing local to fall back on.
        assert!(cache.get::<u32>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_instrumented_tiers_emit_latency() {
        let sink = Arc::new(RecordingSink::default());
        let cache = CacheBuilder::new()
            .event_sink(sink.clone())
            .instrument_tiers(true)
            .build(Arc::new(MemoryBackend::default()));

        let _ = cache.get::<u32>("k").await;
        let tiers: Vec<&'static str> = sink
            .take()
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::TierOperation { tier, .. } => Some(tier),
                _ => None,
            })
            .collect();
        assert_eq!(tiers, vec!["moka", "remote"]);
    }

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.key_prefix, "app");
        assert_eq!(config.default_policy.ttl, Duration::from_secs(300));
        assert_eq!(config.default_policy.swr_window, Duration::from_secs(60));
        assert!(!config.strict_writes);
    }
}
