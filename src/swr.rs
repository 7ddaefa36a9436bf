use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::dedup::{Joined, RequestDeduplicator};
use crate::entry::{Freshness, StoredEntry};
use crate::error::CacheError;
use crate::events::{CacheEvent, CacheStats, EventSink};
use crate::invalidation::InvalidationIndex;
use crate::store::Store;
use crate::tiered::TieredStore;
use crate::utils::{build_cache_key, now_ms};

/// How long an entry stays fresh, how long it may then be served stale, and
/// which tags it is filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Time after a write during which the entry is served without a refresh.
    pub ttl: Duration,
    /// Extra time after `ttl` during which the entry is served while a
    /// background refresh runs. The backing store evicts at `ttl + swr_window`.
    pub swr_window: Duration,
    /// Skip the cached entry and fetch synchronously.
    pub revalidate: bool,
    pub tags: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            ttl: Duration::from_secs(300),
            swr_window: Duration::from_secs(60),
            revalidate: false,
            tags: Vec::new(),
        }
    }
}

impl CachePolicy {
    /// A policy with the given fresh TTL and no stale window.
    pub fn new(ttl: Duration) -> Self {
        CachePolicy {
            ttl,
            swr_window: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_swr_window(mut self, swr_window: Duration) -> Self {
        self.swr_window = swr_window;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Force the next `get_or_set` to fetch regardless of entry age.
    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    /// Hard TTL: how long the backing store keeps the entry.
    pub fn hard_ttl(&self) -> Duration {
        self.ttl + self.swr_window
    }
}

/// Stale-while-revalidate orchestration over the tiers, the tag index and
/// the request deduplicator.
///
/// Values cross the cache as serialized payloads; each caller deserializes
/// its own copy, so a single deduplicated fetch can serve every waiter.
#[derive(Clone)]
pub struct SwrCache {
    prefix: Arc<str>,
    tiers: Arc<TieredStore>,
    index: Arc<InvalidationIndex>,
    dedup: Arc<RequestDeduplicator<StoredEntry>>,
    events: Arc<dyn EventSink>,
    stats: Arc<CacheStats>,
}

impl SwrCache {
    pub fn new(
        prefix: &str,
        tiers: Arc<TieredStore>,
        index: Arc<InvalidationIndex>,
        events: Arc<dyn EventSink>,
        stats: Arc<CacheStats>,
    ) -> Self {
        SwrCache {
            prefix: Arc::from(prefix),
            tiers,
            index,
            dedup: Arc::new(RequestDeduplicator::new()),
            events,
            stats,
        }
    }

    pub fn tiers(&self) -> &Arc<TieredStore> {
        &self.tiers
    }

    pub fn index(&self) -> &Arc<InvalidationIndex> {
        &self.index
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.dedup.in_flight()
    }

    pub fn cache_key(&self, key: &str) -> String {
        build_cache_key(&self.prefix, key)
    }

    /// Return the cached value, fresh or stale.
    ///
    /// Unreadable entries count as misses.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let (entry, _) = self.tiers.lookup(&self.cache_key(key)).await?;
        if entry.is_expired(now_ms()) {
            return None;
        }
        self.decode(key, &entry)
    }

    /// Serialize `value` and write it through both tiers, then file it under
    /// the policy's tags.
    ///
    /// Serialization failures are returned before anything is written.
    pub async fn store<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        policy: &CachePolicy,
    ) -> Result<(), CacheError> {
        let entry = StoredEntry::from_value(value, now_ms(), policy.ttl, policy.swr_window)?;
        self.write_back(&self.cache_key(key), entry, &policy.tags)
            .await
    }

    /// Stale-while-revalidate: get the cached value or load it from origin.
    ///
    /// - fresh: returned as is
    /// - stale: returned immediately, refreshed on a detached task
    /// - missing, expired or `policy.revalidate`: fetched (deduplicated)
    ///   while the caller waits
    ///
    /// `fetch` receives the caller's key. Its failure is returned as
    /// [`CacheError::Origin`] to every caller waiting on it.
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
        let full = self.cache_key(key);

        if !policy.revalidate
            && let Some((entry, _)) = self.tiers.lookup(&full).await
        {
            match entry.freshness(now_ms()) {
                Freshness::Fresh => {
                    if let Some(value) = self.decode(key, &entry) {
                        return Ok(value);
                    }
                }
                Freshness::Stale => {
                    if let Some(value) = self.decode(key, &entry) {
                        self.stats.record_stale_served();
                        self.events.emit(CacheEvent::StaleServed {
                            key: key.to_string(),
                        });
                        self.refresh_in_background(key, full, fetch, policy.clone());
                        return Ok(value);
                    }
                }
                Freshness::Expired => {}
            }
        }

        let pending = self.start_fetch(key, full, fetch, policy.clone());
        if pending.joined {
            self.stats.record_dedup_join();
        }
        let entry = pending.fetch.await?;
        Ok(entry.to_typed::<V>()?.value)
    }

    fn refresh_in_background<V, F, Fut, E>(
        &self,
        key: &str,
        full: String,
        fetch: F,
        policy: CachePolicy,
    ) where
        V: Serialize + Send + 'static,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let pending = self.start_fetch(key, full, fetch, policy);
        if pending.joined {
            // Whoever started it reports its outcome.
            self.stats.record_dedup_join();
            return;
        }

        self.stats.record_refresh();
        let stats = Arc::clone(&self.stats);
        let events = Arc::clone(&self.events);
        let key = key.to_string();
        tokio::spawn(async move {
            match pending.fetch.await {
                Ok(_) => tracing::debug!(%key, "background refresh completed"),
                Err(error) => {
                    stats.record_refresh_failure();
                    events.emit(CacheEvent::RefreshFailed { key, error });
                }
            }
        });
    }

    /// Register (or join) the origin fetch for `full`. The fetch runs on its
    /// own task: it calls the origin, serializes, and writes back with tags.
    fn start_fetch<V, F, Fut, E>(
        &self,
        key: &str,
        full: String,
        fetch: F,
        policy: CachePolicy,
    ) -> Joined<StoredEntry>
    where
        V: Serialize + Send + 'static,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let this = self.clone();
        let origin_key = key.to_string();
        let dedup_key = full.clone();

        self.dedup.start_or_join(&dedup_key, move || async move {
            let value = fetch(origin_key.clone())
                .await
                .map_err(|e| CacheError::origin(origin_key.as_str(), e))?;
            this.stats.record_origin_fetch();

            let entry = StoredEntry::from_value(&value, now_ms(), policy.ttl, policy.swr_window)?;
            if let Err(e) = this.write_back(&full, entry.clone(), &policy.tags).await {
                tracing::debug!(key = %origin_key, error = %e, "fetched value was not cached");
            }
            Ok::<_, CacheError>(entry)
        })
    }

    /// L2 then L1, then the tag index. Tags are only registered once the
    /// entry itself is stored.
    async fn write_back(
        &self,
        full: &str,
        entry: StoredEntry,
        tags: &[String],
    ) -> Result<(), CacheError> {
        let ttl = entry.remaining_ttl(now_ms());
        self.tiers.set(full, entry).await?;

        if let Some(ttl) = ttl
            && !tags.is_empty()
            && let Err(e) = self.index.register_tags(full, tags, ttl).await
        {
            self.stats.record_store_error();
            self.events.emit(CacheEvent::StoreError {
                op: "register_tags",
                key: full.to_string(),
                error: e.clone(),
            });
            return Err(e);
        }
        Ok(())
    }

    fn decode<V: DeserializeOwned>(&self, key: &str, entry: &StoredEntry) -> Option<V> {
        match entry.to_typed::<V>() {
            Ok(typed) => Some(typed.value),
            Err(error) => {
                self.stats.record_store_error();
                self.events.emit(CacheEvent::StoreError {
                    op: "decode",
                    key: key.to_string(),
                    error,
                });
                None
            }
        }
    }
}
