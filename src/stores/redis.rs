use async_trait::async_trait;
use bytes::Bytes;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::connection::{ConnectionConfig, ConnectionManager, HealthReport};
use crate::error::CacheError;
use crate::events::EventSink;

/// Keys fetched per `SCAN` round trip.
const SCAN_PAGE_SIZE: usize = 500;

/// Adds a member to a tag set and extends (never shortens) the set's expiry.
const TAG_ADD_SCRIPT: &str = r"
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
local current = redis.call('PTTL', KEYS[1])
if current < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
";

/// Redis-backed implementation of the backing-store primitives.
///
/// Every command goes through the [`ConnectionManager`], so it inherits its
/// timeout, fail-fast and failover behavior.
pub struct RedisBackend {
    manager: Arc<ConnectionManager>,
    tag_script: Script,
}

impl RedisBackend {
    /// Wrap an existing connection manager.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        RedisBackend {
            manager,
            tag_script: Script::new(TAG_ADD_SCRIPT),
        }
    }

    /// Connect (resolving the primary first) and wrap the manager.
    ///
    /// # Example
    /// ```ignore
    /// let config = ConnectionConfig::sentinel(
    ///     vec!["sentinel-a:26379".into(), "sentinel-b:26379".into()],
    ///     "cache",
    /// );
    /// let backend = RedisBackend::connect(config, Arc::new(TracingSink)).await?;
    /// ```
    pub async fn connect(
        config: ConnectionConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, CacheError> {
        let manager = ConnectionManager::connect(config, events).await?;
        Ok(RedisBackend::new(manager))
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let owned = key.to_string();
        let raw: Option<Vec<u8>> = self
            .manager
            .run("GET", key, |mut conn| async move { conn.get(owned).await })
            .await?;
        Ok(raw.map(Bytes::from))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let owned = key.to_string();
        let ms = ttl_ms(ttl);
        self.manager
            .run("PSETEX", key, |mut conn| async move {
                conn.pset_ex::<_, _, ()>(owned, value.as_ref(), ms).await
            })
            .await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let owned = keys.to_vec();
        let label = keys.join(",");
        self.manager
            .run("DEL", &label, |mut conn| async move { conn.del(owned).await })
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let owned = key.to_string();
        self.manager
            .run("EXISTS", key, |mut conn| async move { conn.exists(owned).await })
            .await
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let owned = key.to_string();
        let ms: i64 = self
            .manager
            .run("PTTL", key, |mut conn| async move { conn.pttl(owned).await })
            .await?;
        // -2: missing, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        // One round trip per page so each stays within the command timeout.
        loop {
            let page_pattern = pattern.to_string();
            let (next, page): (u64, Vec<String>) = self
                .manager
                .run("SCAN", pattern, |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(page_pattern)
                        .arg("COUNT")
                        .arg(SCAN_PAGE_SIZE)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn tag_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), CacheError> {
        let script = self.tag_script.clone();
        let owned = key.to_string();
        let member = member.to_string();
        let ms = ttl_ms(ttl);
        self.manager
            .run("TAG_ADD", key, |mut conn| async move {
                let _: i64 = script
                    .key(owned)
                    .arg(member)
                    .arg(ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn tag_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let owned = key.to_string();
        self.manager
            .run("SMEMBERS", key, |mut conn| async move { conn.smembers(owned).await })
            .await
    }

    async fn check_health(&self) -> HealthReport {
        self.manager.check_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;

    #[test]
    fn test_ttl_ms_never_zero() {
        assert_eq!(ttl_ms(Duration::ZERO), 1);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2_000);
    }

    // Note: These tests require a running Redis instance.
    // Run with: cargo test -- --ignored

    async fn connect() -> RedisBackend {
        RedisBackend::connect(ConnectionConfig::from_env().unwrap(), Arc::new(NoopSink))
            .await
            .expect("Failed to connect to Redis - is it running?")
    }

    #[tokio::test]
    #[ignore = "requires running Redis instance"]
    async fn test_redis_get_set_del() {
        let backend = connect().await;
        let key = "tiered-swr-cache:test:get_set_del".to_string();

        backend
            .set_ex(&key, Bytes::from_static(b"value"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(
            backend.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"value"))
        );
        assert!(backend.exists(&key).await.unwrap());
        assert!(backend.pttl(&key).await.unwrap().unwrap() <= Duration::from_secs(30));

        assert_eq!(backend.del(&[key.clone()]).await.unwrap(), 1);
        assert!(backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis instance"]
    async fn test_redis_tag_expiry_only_extends() {
        let backend = connect().await;
        let tag = "tiered-swr-cache:test:tag".to_string();
        backend.del(&[tag.clone()]).await.unwrap();

        backend.tag_add(&tag, "a", Duration::from_secs(600)).await.unwrap();
        backend.tag_add(&tag, "b", Duration::from_secs(5)).await.unwrap();

        let mut members = backend.tag_members(&tag).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        assert!(backend.pttl(&tag).await.unwrap().unwrap() > Duration::from_secs(500));

        backend.del(&[tag]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis instance"]
    async fn test_redis_scan_match() {
        let backend = connect().await;
        for i in 0..3 {
            backend
                .set_ex(
                    &format!("tiered-swr-cache:scan:{}", i),
                    Bytes::from_static(b"x"),
                    Duration::from_secs(30),
                )
                .await
                .unwrap();
        }

        let keys = backend.scan_match("tiered-swr-cache:scan:*").await.unwrap();
        assert_eq!(keys.len(), 3);
        backend.del(&keys).await.unwrap();
    }
}
