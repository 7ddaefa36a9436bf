use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::backend::Backend;
use crate::connection::{HealthReport, NodeInfo, NodeRole};
use crate::error::CacheError;
use crate::utils::{duration_ms, glob_match, now_ms};

/// Configuration for MemoryBackend.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackendConfig {
    /// Artificial delay added to every operation, to emulate a network hop.
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone)]
enum Value {
    Bytes(Bytes),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    /// Unix millis; `None` never expires.
    expires: Option<i64>,
}

impl Slot {
    fn is_live(&self, now: i64) -> bool {
        self.expires.is_none_or(|at| at > now)
    }
}

/// In-process stand-in for the distributed backing store.
///
/// Implements the same primitives as Redis (expiring values, sets, glob
/// scans) behind a `RwLock<HashMap>`. Useful for tests and single-process
/// development; the data is not shared between processes.
///
/// [`MemoryBackend::set_available`] simulates losing the connection: every
/// operation then fails with [`CacheError::Unavailable`].
pub struct MemoryBackend {
    state: RwLock<HashMap<String, Slot>>,
    available: AtomicBool,
    latency: Option<Duration>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new(MemoryBackendConfig::default())
    }
}

impl MemoryBackend {
    pub fn new(config: MemoryBackendConfig) -> Self {
        MemoryBackend {
            state: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency: config.latency,
        }
    }

    /// Toggle simulated connectivity.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live keys, including tag sets.
    pub async fn len(&self) -> usize {
        let now = now_ms();
        self.state.read().await.values().filter(|s| s.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired slots.
    pub async fn purge_expired(&self) {
        let now = now_ms();
        self.state.write().await.retain(|_, slot| slot.is_live(now));
    }

    async fn enter(&self, op: &'static str) -> Result<(), CacheError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::Unavailable(format!(
                "memory backend offline during {}",
                op
            )))
        }
    }

    async fn live_slot(&self, key: &str) -> Option<Slot> {
        let now = now_ms();
        let state = self.state.read().await;
        state.get(key).filter(|s| s.is_live(now)).cloned()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.enter("GET").await?;
        match self.live_slot(key).await {
            Some(Slot {
                value: Value::Bytes(b),
                ..
            }) => Ok(Some(b)),
            Some(_) => Err(CacheError::operation(
                self.name(),
                key,
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            )),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.enter("PSETEX").await?;
        let expires = now_ms().saturating_add(duration_ms(ttl).max(1));
        self.state.write().await.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value),
                expires: Some(expires),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.enter("DEL").await?;
        let now = now_ms();
        let mut state = self.state.write().await;
        let mut removed = 0;
        for key in keys {
            if state.remove(key).is_some_and(|s| s.is_live(now)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.enter("EXISTS").await?;
        Ok(self.live_slot(key).await.is_some())
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.enter("PTTL").await?;
        let now = now_ms();
        Ok(self
            .live_slot(key)
            .await
            .and_then(|s| s.expires)
            .map(|at| Duration::from_millis((at - now).max(0) as u64)))
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.enter("SCAN").await?;
        let now = now_ms();
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .iter()
            .filter(|(k, s)| s.is_live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn tag_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), CacheError> {
        self.enter("TAG_ADD").await?;
        let now = now_ms();
        let wanted = now.saturating_add(duration_ms(ttl).max(1));
        let mut state = self.state.write().await;

        let slot = state
            .entry(key.to_string())
            .and_modify(|s| {
                if !s.is_live(now) {
                    *s = Slot {
                        value: Value::Set(HashSet::new()),
                        expires: None,
                    };
                }
            })
            .or_insert_with(|| Slot {
                value: Value::Set(HashSet::new()),
                expires: None,
            });

        let Value::Set(members) = &mut slot.value else {
            return Err(CacheError::operation(
                "memory",
                key,
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            ));
        };
        members.insert(member.to_string());
        if slot.expires.is_none_or(|at| at < wanted) {
            slot.expires = Some(wanted);
        }
        Ok(())
    }

    async fn tag_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.enter("SMEMBERS").await?;
        match self.live_slot(key).await {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => Ok(members.into_iter().collect()),
            Some(_) => Err(CacheError::operation(
                self.name(),
                key,
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            )),
            None => Ok(Vec::new()),
        }
    }

    async fn check_health(&self) -> HealthReport {
        let start = Instant::now();
        if let Err(e) = self.enter("PING").await {
            return HealthReport::unhealthy(e.to_string());
        }
        HealthReport {
            healthy: true,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            node: Some(NodeInfo {
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
                role: NodeRole::Primary,
                connected_replicas: 0,
                used_memory_bytes: None,
                used_memory_human: None,
            }),
            error: None,
        }
    }
}
