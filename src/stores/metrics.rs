//! Latency instrumentation for cache tiers.
//!
//! `MetricsStore` wraps any [`Store`] and emits a
//! [`CacheEvent::TierOperation`] for every read, write and remove.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tiered_swr_cache::{EventSink, MetricsStore, MokaStore, MokaStoreConfig, Store};
//!
//! let sink: Arc<dyn EventSink> = Arc::new(MyPrometheusSink::new());
//! let moka: Arc<dyn Store> = Arc::new(MokaStore::new(MokaStoreConfig::default()));
//! let l1: Arc<dyn Store> = Arc::new(MetricsStore::new(moka, sink));
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::entry::StoredEntry;
use crate::error::CacheError;
use crate::events::{CacheEvent, EventSink};
use crate::store::Store;

/// A store wrapper that reports the latency and outcome of every operation.
pub struct MetricsStore {
    inner: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
}

impl MetricsStore {
    pub fn new(inner: Arc<dyn Store>, sink: Arc<dyn EventSink>) -> Self {
        MetricsStore { inner, sink }
    }

    fn report(&self, op: &'static str, key: String, hit: Option<bool>, start: Instant) {
        self.sink.emit(CacheEvent::TierOperation {
            op,
            tier: self.inner.name(),
            key,
            hit,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        });
    }
}

#[async_trait]
impl Store for MetricsStore {
    // Transparent: report under the wrapped tier's name.
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let start = Instant::now();
        let result = self.inner.get(key).await;
        let hit = match &result {
            Ok(found) => Some(found.is_some()),
            Err(_) => None,
        };
        self.report("get", key.to_string(), hit, start);
        result
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.set(key, entry).await;
        self.report("set", key.to_string(), None, start);
        result
    }

    async fn remove(&self, keys: &[String]) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.remove(keys).await;
        self.report("remove", keys.join(","), None, start);
        result
    }

    async fn remove_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let start = Instant::now();
        let result = self.inner.remove_matching(pattern).await;
        self.report("remove_matching", pattern.to_string(), None, start);
        result
    }
}
