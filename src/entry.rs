use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

use crate::error::CacheError;
use crate::utils::duration_ms;

/// Envelope format written in front of every payload in the backing store.
const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8 * 3;

/// A decoded cache entry containing a value and its expiration times.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<V> {
    /// The cached value.
    pub value: V,

    /// Unix timestamp in milliseconds of the write that produced this entry.
    pub stored_at: i64,

    /// Unix timestamp in milliseconds.
    /// Before this time the entry is considered fresh and valid.
    pub fresh_until: i64,

    /// Unix timestamp in milliseconds.
    /// Do not use data after this point as it is considered no longer valid.
    pub stale_until: i64,
}

/// Freshness of an entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `fresh_until`.
    Fresh,
    /// Between `fresh_until` and `stale_until`: servable, needs a refresh.
    Stale,
    /// At or past `stale_until`: must not be served.
    Expired,
}

/// Opaque, serialized cache entry as it is held by both tiers.
///
/// The payload is whatever the producer serialized; the cache never looks
/// inside it. Cloning is cheap (reference-counted bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub payload: Bytes,
    pub stored_at: i64,
    pub fresh_until: i64,
    pub stale_until: i64,
}

impl StoredEntry {
    /// Create an entry written at `now` that is fresh for `fresh_ttl` and then
    /// servable-but-stale for another `swr_window`.
    pub fn new(payload: Bytes, now: i64, fresh_ttl: Duration, swr_window: Duration) -> Self {
        let fresh_until = now.saturating_add(duration_ms(fresh_ttl));
        StoredEntry {
            payload,
            stored_at: now,
            fresh_until,
            stale_until: fresh_until.saturating_add(duration_ms(swr_window)),
        }
    }

    /// Serialize a typed value into an entry.
    ///
    /// Fails synchronously if `value` cannot be serialized.
    pub fn from_value<V: Serialize>(
        value: &V,
        now: i64,
        fresh_ttl: Duration,
        swr_window: Duration,
    ) -> Result<Self, CacheError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))?;
        Ok(StoredEntry::new(payload.into(), now, fresh_ttl, swr_window))
    }

    /// Deserialize the payload into a typed `Entry<V>`.
    pub fn to_typed<V: DeserializeOwned>(&self) -> Result<Entry<V>, CacheError> {
        let value = serde_json::from_slice(&self.payload)
            .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e)))?;
        Ok(Entry {
            value,
            stored_at: self.stored_at,
            fresh_until: self.fresh_until,
            stale_until: self.stale_until,
        })
    }

    /// Encode the entry as `[version][stored_at][fresh_until][stale_until][payload]`
    /// with big-endian timestamps.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_i64(self.stored_at);
        buf.put_i64(self.fresh_until);
        buf.put_i64(self.stale_until);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode an envelope produced by [`StoredEntry::encode`].
    pub fn decode(mut raw: Bytes) -> Result<Self, CacheError> {
        if raw.len() < HEADER_LEN {
            return Err(CacheError::Serialization(format!(
                "entry envelope too short: {} bytes",
                raw.len()
            )));
        }
        let version = raw.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(CacheError::Serialization(format!(
                "unsupported entry envelope version {}",
                version
            )));
        }
        let stored_at = raw.get_i64();
        let fresh_until = raw.get_i64();
        let stale_until = raw.get_i64();
        Ok(StoredEntry {
            payload: raw,
            stored_at,
            fresh_until,
            stale_until,
        })
    }

    /// Freshness of the entry at `now_ms`.
    pub fn freshness(&self, now_ms: i64) -> Freshness {
        if now_ms < self.fresh_until {
            Freshness::Fresh
        } else if now_ms < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Check if the entry has expired and should not be used.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.stale_until
    }

    /// Time left until the entry must be evicted, or `None` if already expired.
    pub fn remaining_ttl(&self, now_ms: i64) -> Option<Duration> {
        let left = self.stale_until - now_ms;
        (left > 0).then(|| Duration::from_millis(left as u64))
    }

    /// Age of the entry at `now_ms`.
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis((now_ms - self.stored_at).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_preserves_timestamps_and_payload() {
        let entry = StoredEntry::new(
            Bytes::from_static(b"{\"id\":42}"),
            1_000,
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        assert_eq!(entry.fresh_until, 301_000);
        assert_eq!(entry.stale_until, 361_000);

        let decoded = StoredEntry::decode(entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            StoredEntry::decode(Bytes::from_static(b"nope")),
            Err(CacheError::Serialization(_))
        ));

        let mut raw = StoredEntry::new(Bytes::new(), 0, Duration::ZERO, Duration::ZERO)
            .encode()
            .to_vec();
        raw[0] = 99;
        assert!(StoredEntry::decode(raw.into()).is_err());
    }

    #[test]
    fn test_freshness_windows() {
        let entry = StoredEntry::new(
            Bytes::new(),
            0,
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert_eq!(entry.freshness(0), Freshness::Fresh);
        assert_eq!(entry.freshness(99), Freshness::Fresh);
        assert_eq!(entry.freshness(100), Freshness::Stale);
        assert_eq!(entry.freshness(149), Freshness::Stale);
        assert_eq!(entry.freshness(150), Freshness::Expired);
        assert_eq!(entry.remaining_ttl(120), Some(Duration::from_millis(30)));
        assert_eq!(entry.remaining_ttl(150), None);
        assert_eq!(entry.age(120), Duration::from_millis(120));
    }

    #[test]
    fn test_typed_round_trip_through_payload() {
        let entry =
            StoredEntry::from_value(&vec![1u32, 2, 3], 0, Duration::from_secs(1), Duration::ZERO)
                .unwrap();
        let typed: Entry<Vec<u32>> = entry.to_typed().unwrap();
        assert_eq!(typed.value, vec![1, 2, 3]);
        assert_eq!(typed.stale_until, 1_000);

        let wrong: Result<Entry<String>, _> = entry.to_typed();
        assert!(matches!(wrong, Err(CacheError::Serialization(_))));
    }
}
