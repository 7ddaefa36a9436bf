//! Observability interface for the cache.
//!
//! Every component reports what happened through an [`EventSink`]. The
//! default sink forwards events to `tracing`; applications can plug their own
//! sink to feed metrics backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CacheError;

/// Which tier served or failed an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    L1,
    L2,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::L1 => f.write_str("l1"),
            Tier::L2 => f.write_str("l2"),
        }
    }
}

/// Connection state of the backing store as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Structured events emitted by the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A read was served by a tier.
    Hit { key: String, tier: Tier },
    /// No tier had a usable entry.
    Miss { key: String },
    /// A tier operation failed and was degraded.
    StoreError {
        op: &'static str,
        key: String,
        error: CacheError,
    },
    /// A stale value was served and a background refresh was scheduled.
    StaleServed { key: String },
    /// A background refresh failed; the caller already got stale data.
    RefreshFailed { key: String, error: CacheError },
    /// Some keys under a tag or pattern could not be removed.
    InvalidationFailed { target: String, error: CacheError },
    /// Emitted by `MetricsStore` for every tier operation.
    TierOperation {
        op: &'static str,
        tier: &'static str,
        key: String,
        hit: Option<bool>,
        latency_ms: f64,
    },
    /// The backing store connection went up or down.
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Sentinel resolution returned a different primary.
    PrimaryChanged {
        previous: Option<String>,
        current: String,
    },
    /// The health monitor saw the backing store turn healthy or unhealthy.
    HealthChanged {
        healthy: bool,
        latency_ms: Option<u64>,
        error: Option<String>,
    },
}

/// Trait for receiving cache events.
///
/// `emit` is called in the hot path; implementations should be fast
/// (e.g., increment counters or buffer in memory).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CacheEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CacheEvent) {
        match event {
            CacheEvent::Hit { key, tier } => tracing::trace!(%key, %tier, "cache hit"),
            CacheEvent::Miss { key } => tracing::trace!(%key, "cache miss"),
            CacheEvent::StoreError { op, key, error } => {
                tracing::warn!(op, %key, error = %error, "cache store operation failed")
            }
            CacheEvent::StaleServed { key } => {
                tracing::debug!(%key, "served stale entry, refreshing in background")
            }
            CacheEvent::RefreshFailed { key, error } => {
                tracing::warn!(%key, error = %error, "background refresh failed")
            }
            CacheEvent::InvalidationFailed { target, error } => {
                tracing::warn!(%target, error = %error, "invalidation partially failed")
            }
            CacheEvent::TierOperation {
                op,
                tier,
                key,
                hit,
                latency_ms,
            } => tracing::trace!(op, tier, %key, ?hit, latency_ms, "tier operation"),
            CacheEvent::ConnectionStateChanged { from, to } => {
                if to == ConnectionState::Connected {
                    tracing::info!(?from, ?to, "backing store connection state changed")
                } else {
                    tracing::error!(?from, ?to, "backing store connection state changed")
                }
            }
            CacheEvent::PrimaryChanged { previous, current } => {
                tracing::info!(?previous, %current, "backing store primary changed")
            }
            CacheEvent::HealthChanged {
                healthy: true,
                latency_ms,
                ..
            } => tracing::info!(?latency_ms, "backing store healthy"),
            CacheEvent::HealthChanged { error, .. } => {
                tracing::error!(?error, "backing store unhealthy")
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: CacheEvent) {}
}

/// Fans one event out to several sinks.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: CacheEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Process-local counters for cache activity.
#[derive(Debug, Default)]
pub struct CacheStats {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    origin_fetches: AtomicU64,
    dedup_joins: AtomicU64,
    stale_served: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    store_errors: AtomicU64,
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub origin_fetches: u64,
    pub dedup_joins: u64,
    pub stale_served: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub store_errors: u64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self, tier: Tier) {
        match tier {
            Tier::L1 => self.l1_hits.fetch_add(1, Ordering::Relaxed),
            Tier::L2 => self.l2_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_origin_fetch(&self) {
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            origin_fetches: self.origin_fetches.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn test_fanout_delivers_to_all_sinks() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(NoopSink)]);

        fanout.emit(CacheEvent::Miss { key: "k".into() });

        assert_eq!(a.take().len(), 1);
        assert_eq!(b.take().len(), 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = CacheStats::default();
        stats.record_hit(Tier::L1);
        stats.record_hit(Tier::L2);
        stats.record_hit(Tier::L2);
        stats.record_miss();
        stats.record_origin_fetch();

        let snap = stats.snapshot();
        assert_eq!(snap.l1_hits, 1);
        assert_eq!(snap.l2_hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.origin_fetches, 1);
        assert_eq!(snap.dedup_joins, 0);
    }
}
