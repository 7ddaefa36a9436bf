use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::builder::{CacheBuilder, CacheConfig};
use crate::connection::HealthReport;
use crate::error::CacheError;
use crate::events::StatsSnapshot;
use crate::store::Store;
use crate::swr::{CachePolicy, SwrCache};

/// High-level cache API: an L1/L2 tiered store with stale-while-revalidate
/// reads, tag invalidation and request deduplication.
///
/// Cloning is cheap and every clone shares the same tiers, in-flight table
/// and counters.
///
/// Backing-store failures never turn into application errors: reads degrade
/// to misses and writes are reported through the event sink. Set
/// [`CacheConfig::strict_writes`] to get write and delete failures back.
#[derive(Clone)]
pub struct Cache {
    swr: SwrCache,
    backend: Arc<dyn Backend>,
    config: Arc<CacheConfig>,
}

impl Cache {
    pub(crate) fn new(swr: SwrCache, backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Cache {
            swr,
            backend,
            config: Arc::new(config),
        }
    }

    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The default policy, as a starting point for per-call policies.
    ///
    /// # Example
    /// ```ignore
    /// let policy = cache.policy().with_tags(["org:7"]);
    /// ```
    pub fn policy(&self) -> CachePolicy {
        self.config.default_policy.clone()
    }

    /// Return the cached value.
    ///
    /// Returns `None` for misses, for entries that cannot be deserialized
    /// into `V` and when the backing store is unreachable.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.swr.get(key).await
    }

    /// Cache `value` for exactly `ttl`, filed under `tags`.
    ///
    /// # Example
    /// ```ignore
    /// cache.set("meeting:42", &meeting, Duration::from_secs(300), &["org:7"]).await?;
    /// ```
    pub async fn set<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let policy = CachePolicy::new(ttl).with_tags(tags.iter().copied());
        self.set_with_policy(key, value, &policy).await
    }

    /// Cache `value` with a fresh TTL plus a stale window.
    ///
    /// Serialization errors are always returned.
    pub async fn set_with_policy<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        policy: &CachePolicy,
    ) -> Result<(), CacheError> {
        let result = self.swr.store(key, value, policy).await;
        self.tolerate("set", key, result)
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let result = self.swr.tiers().remove(&[self.swr.cache_key(key)]).await;
        self.tolerate("delete", key, result)
    }

    /// Remove every key written under `tag`. Returns how many keys were
    /// targeted.
    ///
    /// Failures are always returned: the caller asked for data to go away and
    /// must know when some of it did not.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<u64, CacheError> {
        self.swr.index().invalidate_tag(tag).await
    }

    /// Remove every key matching a glob (`*`, `?`, `[..]`) over caller keys.
    ///
    /// Scans the whole keyspace of the backing store. Administrative use only.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        self.swr.index().invalidate_pattern(pattern).await
    }

    /// Stale-while-revalidate read-through.
    ///
    /// # Example
    /// ```ignore
    /// let report: Report = cache
    ///     .get_or_set("report:9", |key| async move { db.load_report(&key).await }, &cache.policy())
    ///     .await?;
    /// ```
    pub async fn get_or_set<V, F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
        policy: &CachePolicy,
    ) -> Result<V, CacheError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        self.swr.get_or_set(key, fetch, policy).await
    }

    /// Probe the backing store.
    pub async fn check_health(&self) -> HealthReport {
        self.backend.check_health().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.swr.stats().snapshot()
    }

    /// Number of origin fetches currently in flight in this process.
    pub fn in_flight(&self) -> usize {
        self.swr.in_flight()
    }

    fn tolerate(
        &self,
        op: &'static str,
        key: &str,
        result: Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        match result {
            Err(e) if e.is_transient() && !self.config.strict_writes => {
                // Already reported by the tier that failed.
                tracing::debug!(op, key, error = %e, "ignoring backing store failure");
                Ok(())
            }
            other => other,
        }
    }
}
