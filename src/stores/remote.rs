use async_trait::async_trait;
use std::sync::Arc;

use crate::backend::Backend;
use crate::entry::StoredEntry;
use crate::error::CacheError;
use crate::invalidation::REMOVE_BATCH;
use crate::store::Store;
use crate::utils::now_ms;

/// Distributed L2 tier: entry envelopes stored in a [`Backend`].
///
/// The backend evicts each key at the entry's `stale_until`, so a key that
/// exists in the backend is always servable (fresh or stale).
pub struct RemoteStore {
    backend: Arc<dyn Backend>,
}

impl RemoteStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        RemoteStore { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

#[async_trait]
impl Store for RemoteStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let entry = StoredEntry::decode(raw)?;
        // Clock skew between writers can leave a key alive past its envelope.
        if entry.is_expired(now_ms()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        match entry.remaining_ttl(now_ms()) {
            Some(ttl) => self.backend.set_ex(key, entry.encode(), ttl).await,
            None => self.backend.del(&[key.to_string()]).await.map(|_| ()),
        }
    }

    async fn remove(&self, keys: &[String]) -> Result<(), CacheError> {
        self.backend.del(keys).await.map(|_| ())
    }

    /// Scan, then delete in batches. Every batch is attempted; failures are
    /// aggregated.
    async fn remove_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let keys = self.backend.scan_match(pattern).await?;
        let mut failures = Vec::new();
        for batch in keys.chunks(REMOVE_BATCH) {
            if let Err(e) = self.remove(batch).await {
                failures.push(e);
            }
        }
        match CacheError::aggregate("remove_matching", failures) {
            Some(e) => Err(e),
            None => Ok(keys.len() as u64),
        }
    }
}
