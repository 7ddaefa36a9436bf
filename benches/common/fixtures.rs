use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Payload cached by the benchmarks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchMeeting {
    pub id: u64,
    pub org: u64,
    pub title: String,
    pub attendees: Vec<String>,
}

impl BenchMeeting {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            org: id % 50,
            title: format!("Meeting {}", id),
            attendees: (0..4).map(|i| format!("user{}@example.com", id + i)).collect(),
        }
    }
}

/// Simulated database with configurable latency
#[derive(Clone)]
pub struct FakeDatabase {
    data: Arc<HashMap<String, BenchMeeting>>,
    latency_ms: u64,
    query_count: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(num_meetings: usize, latency_ms: u64) -> Self {
        let data = (0..num_meetings)
            .map(|i| (format!("meeting:{}", i), BenchMeeting::new(i as u64)))
            .collect();

        Self {
            data: Arc::new(data),
            latency_ms,
            query_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<BenchMeeting, String> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        self.data
            .get(key)
            .cloned()
            .ok_or_else(|| format!("{} not found", key))
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn reset_count(&self) {
        self.query_count.store(0, Ordering::Relaxed);
    }
}

/// Generate test keys for different workload patterns
pub struct KeyGenerator {
    num_keys: usize,
}

impl KeyGenerator {
    pub fn new(num_keys: usize) -> Self {
        Self { num_keys }
    }

    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_keys).map(|i| format!("meeting:{}", i)).collect()
    }

    /// 80% of requests go to 20% of keys
    pub fn skewed(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let hot = (self.num_keys / 5).max(1);
        (0..count)
            .map(|_| {
                let id = if rng.gen_bool(0.8) {
                    rng.gen_range(0..hot)
                } else {
                    rng.gen_range(0..self.num_keys)
                };
                format!("meeting:{}", id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_database() {
        let db = FakeDatabase::new(100, 1);

        let meeting = db.get("meeting:0").await.unwrap();
        assert_eq!(meeting.id, 0);
        assert!(db.get("meeting:100").await.is_err());
        assert_eq!(db.query_count(), 2);
    }

    #[test]
    fn test_key_generator() {
        let key_gen = KeyGenerator::new(100);

        let seq = key_gen.sequential();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq[0], "meeting:0");

        let skewed = key_gen.skewed(50);
        assert_eq!(skewed.len(), 50);
    }
}
