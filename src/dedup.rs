//! Collapses concurrent fetches for the same key into one.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::error::CacheError;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct PendingFetch<T: Clone> {
    /// Distinguishes this fetch from a later one registered under the same key.
    id: u64,
    shared: SharedFetch<T>,
}

/// A registered fetch, either started by this caller or joined.
pub(crate) struct Joined<T: Clone> {
    pub(crate) fetch: SharedFetch<T>,
    pub(crate) joined: bool,
}

/// Process-local table of in-flight origin fetches.
///
/// The first caller for a key registers a fetch and runs it on a detached
/// task; every caller arriving while it runs awaits the same shared result.
/// The registration is removed as soon as the fetch settles, before the
/// result reaches any waiter, so a failure is never handed to a later retry.
///
/// Dropping a waiter never cancels the fetch.
pub struct RequestDeduplicator<T: Clone> {
    pending: Arc<DashMap<String, PendingFetch<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        RequestDeduplicator {
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `fetch` unless a fetch for `key` is already in flight, in which
    /// case wait for that one instead. `fetch` is not called when joining.
    ///
    /// # Example
    /// ```ignore
    /// let dedup = RequestDeduplicator::new();
    /// let report = dedup
    ///     .run_exclusive("report:9", || async { load_report(9).await })
    ///     .await?;
    /// ```
    pub async fn run_exclusive<F, Fut>(&self, key: &str, fetch: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        self.start_or_join(key, fetch).fetch.await
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn start_or_join<F, Fut>(&self, key: &str, fetch: F) -> Joined<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let label = key.to_string();
        let shared: SharedFetch<T> = rx
            .map(move |received| {
                received.unwrap_or_else(|_| {
                    Err(CacheError::operation(
                        "dedup",
                        label,
                        "fetch task ended without a result",
                    ))
                })
            })
            .boxed()
            .shared();

        // Check-and-insert under the shard lock.
        match self.pending.entry(key.to_string()) {
            MapEntry::Occupied(existing) => {
                return Joined {
                    fetch: existing.get().shared.clone(),
                    joined: true,
                };
            }
            MapEntry::Vacant(slot) => {
                slot.insert(PendingFetch {
                    id,
                    shared: shared.clone(),
                });
            }
        }

        tracing::trace!(key, id, "starting deduplicated fetch");
        let fut = fetch();
        let pending = Arc::clone(&self.pending);
        let key = key.to_string();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CacheError::origin(key.as_str(), "fetch panicked")));
            pending.remove_if(&key, |_, p| p.id == id);
            // Every waiter may have gone away; the result is simply dropped then.
            let _ = tx.send(result);
        });

        Joined {
            fetch: shared,
            joined: false,
        }
    }
}
