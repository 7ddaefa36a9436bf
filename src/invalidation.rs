//! Tag and pattern based group invalidation.
//!
//! Every tag owns a set in the backing store (`{prefix}:v1:t:{tag}`) holding
//! the data keys written under it. The set's expiry is only ever extended,
//! so it outlives every entry it points to.
//!
//! Invalidation is not atomic across keys: a `set` racing with
//! `invalidate_tag` on the same key may leave its value behind. Members
//! pointing at already evicted keys are harmless and disappear with the set.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::CacheError;
use crate::events::{CacheEvent, EventSink};
use crate::store::Store;
use crate::tiered::TieredStore;
use crate::utils::{build_pattern, build_tag_key};

/// Keys deleted per round trip.
pub(crate) const REMOVE_BATCH: usize = 500;

/// Reverse index from tags to cache keys.
pub struct InvalidationIndex {
    prefix: String,
    backend: Arc<dyn Backend>,
    tiers: Arc<TieredStore>,
    events: Arc<dyn EventSink>,
}

impl InvalidationIndex {
    pub fn new(
        prefix: impl Into<String>,
        backend: Arc<dyn Backend>,
        tiers: Arc<TieredStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        InvalidationIndex {
            prefix: prefix.into(),
            backend,
            tiers,
            events,
        }
    }

    /// Record `key` (a fully qualified data key) under each tag.
    ///
    /// `ttl` is the lifetime of the entry just written; tag sets are kept
    /// alive at least that long.
    pub async fn register_tags(
        &self,
        key: &str,
        tags: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut failures = Vec::new();
        for tag in tags {
            let tag_key = build_tag_key(&self.prefix, tag);
            if let Err(e) = self.backend.tag_add(&tag_key, key, ttl).await {
                failures.push(e);
            }
        }
        match CacheError::aggregate("register_tags", failures) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every key registered under `tag`, then the tag itself.
    ///
    /// Returns how many keys were targeted. An empty or expired tag is a
    /// no-op. If some removals fail the successful ones stay removed and
    /// the tag set is kept so a retry can find the remainder.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<u64, CacheError> {
        let result = self.try_invalidate_tag(tag).await;
        if let Err(e) = &result {
            self.events.emit(CacheEvent::InvalidationFailed {
                target: format!("tag:{}", tag),
                error: e.clone(),
            });
        }
        result
    }

    async fn try_invalidate_tag(&self, tag: &str) -> Result<u64, CacheError> {
        let tag_key = build_tag_key(&self.prefix, tag);
        let members = self.backend.tag_members(&tag_key).await?;
        if members.is_empty() {
            return Ok(0);
        }

        self.remove_all(&members).await?;
        self.backend.del(&[tag_key]).await?;

        tracing::debug!(tag, keys = members.len(), "invalidated tag");
        Ok(members.len() as u64)
    }

    /// Remove every cached key matching a glob over caller keys.
    ///
    /// Walks the whole keyspace; meant for administrative use, not hot paths.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let result = self.try_invalidate_pattern(pattern).await;
        if let Err(e) = &result {
            self.events.emit(CacheEvent::InvalidationFailed {
                target: format!("pattern:{}", pattern),
                error: e.clone(),
            });
        }
        result
    }

    async fn try_invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let full_pattern = build_pattern(&self.prefix, pattern);
        let removed = self.tiers.remove_matching(&full_pattern).await?;

        tracing::debug!(pattern, keys = removed, "invalidated pattern");
        Ok(removed)
    }

    async fn remove_all(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut failures = Vec::new();
        for batch in keys.chunks(REMOVE_BATCH) {
            if let Err(e) = self.tiers.remove(batch).await {
                failures.push(e);
            }
        }
        match CacheError::aggregate("invalidate", failures) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::StoredEntry;
    use crate::events::testing::RecordingSink;
    use crate::events::{CacheStats, NoopSink};
    use crate::stores::memory::MemoryBackend;
    use crate::stores::moka::{MokaStore, MokaStoreConfig};
    use crate::stores::remote::RemoteStore;
    use crate::utils::{build_cache_key, now_ms};
    use bytes::Bytes;

    struct Fixture {
        index: InvalidationIndex,
        tiers: Arc<TieredStore>,
        backend: Arc<MemoryBackend>,
    }

    fn fixture(events: Arc<dyn EventSink>) -> Fixture {
        let backend = Arc::new(MemoryBackend::default());
        let tiers = Arc::new(TieredStore::new(
            Some(Arc::new(MokaStore::new(MokaStoreConfig::default()))),
            Arc::new(RemoteStore::new(backend.clone())),
            Arc::new(NoopSink),
            Arc::new(CacheStats::default()),
        ));
        Fixture {
            index: InvalidationIndex::new("app", backend.clone(), tiers.clone(), events),
            tiers,
            backend,
        }
    }

    async fn put(f: &Fixture, key: &str, tags: &[&str]) -> String {
        let full = build_cache_key("app", key);
        let entry = StoredEntry::new(
            Bytes::from_static(b"v"),
            now_ms(),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        f.tiers.set(&full, entry).await.unwrap();
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        f.index
            .register_tags(&full, &tags, Duration::from_secs(60))
            .await
            .unwrap();
        full
    }

    #[tokio::test]
    async fn test_invalidate_tag_removes_members_and_index() {
        let f = fixture(Arc::new(NoopSink));
        let a = put(&f, "a", &["t1"]).await;
        let b = put(&f, "b", &["t1", "t2"]).await;
        let c = put(&f, "c", &["t2"]).await;

        assert_eq!(f.index.invalidate_tag("t1").await.unwrap(), 2);

        assert!(f.tiers.get(&a).await.unwrap().is_none());
        assert!(f.tiers.get(&b).await.unwrap().is_none());
        assert!(f.tiers.get(&c).await.unwrap().is_some());
        assert!(!f.backend.exists("app:v1:t:t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_tag_is_noop() {
        let f = fixture(Arc::new(NoopSink));
        assert_eq!(f.index.invalidate_tag("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dangling_members_are_tolerated() {
        let f = fixture(Arc::new(NoopSink));
        let a = put(&f, "a", &["t"]).await;
        f.tiers.remove(&[a]).await.unwrap();

        assert_eq!(f.index.invalidate_tag("t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_invalidation_keeps_tag_and_reports() {
        let sink = Arc::new(RecordingSink::default());
        let f = fixture(sink.clone());
        put(&f, "a", &["t"]).await;

        f.backend.set_available(false);
        assert!(f.index.invalidate_tag("t").await.is_err());

        f.backend.set_available(true);
        assert!(f.backend.exists("app:v1:t:t").await.unwrap());
        assert_eq!(f.index.invalidate_tag("t").await.unwrap(), 1);
        assert!(sink.take().iter().any(|e| matches!(
            e,
            CacheEvent::InvalidationFailed { target, .. } if target == "tag:t"
        )));
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let f = fixture(Arc::new(NoopSink));
        let m1 = put(&f, "meeting:1", &[]).await;
        let m2 = put(&f, "meeting:2", &[]).await;
        let r1 = put(&f, "report:1", &[]).await;

        assert_eq!(f.index.invalidate_pattern("meeting:*").await.unwrap(), 2);
        assert!(f.tiers.get(&m1).await.unwrap().is_none());
        assert!(f.tiers.get(&m2).await.unwrap().is_none());
        assert!(f.tiers.get(&r1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_pattern_sweeps_local_copies() {
        let f = fixture(Arc::new(NoopSink));
        let m1 = put(&f, "meeting:1", &[]).await;
        // Evicted from the backing store, still held locally.
        f.backend.del(&[m1.clone()]).await.unwrap();
        assert!(f.tiers.get(&m1).await.unwrap().is_some());

        assert_eq!(f.index.invalidate_pattern("meeting:*").await.unwrap(), 0);
        assert!(f.tiers.get(&m1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_pattern_invalidation_reports() {
        let sink = Arc::new(RecordingSink::default());
        let f = fixture(sink.clone());
        put(&f, "meeting:1", &[]).await;

        f.backend.set_available(false);
        assert!(f.index.invalidate_pattern("meeting:*").await.is_err());
        assert!(sink.take().iter().any(|e| matches!(
            e,
            CacheEvent::InvalidationFailed { target, .. } if target == "pattern:meeting:*"
        )));
    }

    #[tokio::test]
    async fn test_pattern_never_matches_tag_sets() {
        let f = fixture(Arc::new(NoopSink));
        put(&f, "a", &["x"]).await;

        f.index.invalidate_pattern("*").await.unwrap();
        assert!(f.backend.exists("app:v1:t:x").await.unwrap());
    }
}
