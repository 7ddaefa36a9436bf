use async_trait::async_trait;
use futures::future::join;
use std::sync::Arc;

use crate::entry::StoredEntry;
use crate::error::CacheError;
use crate::events::{CacheEvent, CacheStats, EventSink, Tier};
use crate::store::Store;
use crate::utils::now_ms;

/// TieredStore checks a fast local tier (L1) before the distributed tier (L2).
///
/// L2 is the source of truth; L1 only ever holds entries that were read from
/// or successfully written to L2, with the same `stale_until`. Reads degrade
/// errors to misses; writes and removes surface them to the caller.
pub struct TieredStore {
    l1: Option<Arc<dyn Store>>,
    l2: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    stats: Arc<CacheStats>,
}

impl TieredStore {
    /// Create a new tiered store.
    ///
    /// `l1` can be `None` to run against the distributed tier only.
    ///
    /// # Example
    /// ```ignore
    /// TieredStore::new(
    ///     Some(Arc::new(MokaStore::new(MokaStoreConfig::default()))),
    ///     Arc::new(RemoteStore::new(backend)),
    ///     Arc::new(TracingSink),
    ///     Arc::new(CacheStats::default()),
    /// )
    /// ```
    pub fn new(
        l1: Option<Arc<dyn Store>>,
        l2: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        stats: Arc<CacheStats>,
    ) -> Self {
        TieredStore {
            l1,
            l2,
            events,
            stats,
        }
    }

    fn report(&self, op: &'static str, key: &str, error: CacheError) {
        self.stats.record_store_error();
        self.events.emit(CacheEvent::StoreError {
            op,
            key: key.to_string(),
            error,
        });
    }

    /// Look up `key`, reporting which tier answered.
    pub async fn lookup(&self, key: &str) -> Option<(StoredEntry, Tier)> {
        if let Some(l1) = &self.l1 {
            match l1.get(key).await {
                Ok(Some(entry)) => {
                    self.stats.record_hit(Tier::L1);
                    self.events.emit(CacheEvent::Hit {
                        key: key.to_string(),
                        tier: Tier::L1,
                    });
                    return Some((entry, Tier::L1));
                }
                Ok(None) => {}
                Err(e) => self.report("l1_get", key, e),
            }
        }

        let entry = match self.l2.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.miss(key);
                return None;
            }
            Err(e) => {
                // Unreachable backend or corrupt envelope: either way a miss.
                self.report("l2_get", key, e);
                self.miss(key);
                return None;
            }
        };

        if let Some(l1) = &self.l1
            && let Err(e) = l1.set(key, entry.clone()).await
        {
            self.report("l1_populate", key, e);
        }

        self.stats.record_hit(Tier::L2);
        self.events.emit(CacheEvent::Hit {
            key: key.to_string(),
            tier: Tier::L2,
        });
        Some((entry, Tier::L2))
    }

    fn miss(&self, key: &str) {
        self.stats.record_miss();
        self.events.emit(CacheEvent::Miss {
            key: key.to_string(),
        });
    }

}

#[async_trait]
impl Store for TieredStore {
    fn name(&self) -> &'static str {
        "tiered"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        Ok(self.lookup(key).await.map(|(entry, _)| entry))
    }

    /// Write L2 first and populate L1 only once L2 accepted the entry.
    ///
    /// On an L2 failure any older L1 copy is evicted so L1 can never serve
    /// something L2 would not.
    async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        if entry.is_expired(now_ms()) {
            return self.remove(&[key.to_string()]).await;
        }

        if let Err(e) = self.l2.set(key, entry.clone()).await {
            if let Some(l1) = &self.l1
                && let Err(evict) = l1.remove(&[key.to_string()]).await
            {
                self.report("l1_evict", key, evict);
            }
            self.report("l2_set", key, e.clone());
            return Err(e);
        }

        if let Some(l1) = &self.l1
            && let Err(e) = l1.set(key, entry).await
        {
            // L2 holds the entry; the next read repopulates L1.
            self.report("l1_set", key, e);
        }
        Ok(())
    }

    /// Remove from both tiers; both are attempted even if one fails.
    async fn remove(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }

        let l1 = async {
            match &self.l1 {
                Some(l1) => l1.remove(keys).await,
                None => Ok(()),
            }
        };
        let (l1_result, l2_result) = join(l1, self.l2.remove(keys)).await;

        let label = keys.join(",");
        let failures: Vec<CacheError> = [l1_result.err(), l2_result.err()]
            .into_iter()
            .flatten()
            .inspect(|e| self.report("remove", &label, e.clone()))
            .collect();

        match CacheError::aggregate("remove", failures) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sweep both tiers. L1 is swept on its own since it may still hold keys
    /// the backing store already evicted. Returns the L2 count.
    async fn remove_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let l1 = async {
            match &self.l1 {
                Some(l1) => l1.remove_matching(pattern).await,
                None => Ok(0),
            }
        };
        let (l1_result, l2_result) = join(l1, self.l2.remove_matching(pattern)).await;

        let removed = *l2_result.as_ref().unwrap_or(&0);
        let failures: Vec<CacheError> = [l1_result.err(), l2_result.err()]
            .into_iter()
            .flatten()
            .inspect(|e| self.report("remove_matching", pattern, e.clone()))
            .collect();
        match CacheError::aggregate("remove_matching", failures) {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}
