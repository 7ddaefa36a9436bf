use std::env;
use std::time::Duration;

/// Configuration for benchmarks, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Benchmark against Redis configured through `CACHE_REDIS_*` (BENCH_REDIS=1)
    /// instead of the in-memory backend.
    pub use_redis: bool,

    /// Simulated distributed-tier round trip (BENCH_BACKEND_LATENCY_US, defaults to 200)
    pub backend_latency: Duration,

    /// Simulated database latency in milliseconds (from DB_LATENCY_MS env var, defaults to 50)
    pub db_latency_ms: u64,

    /// Sample size for benchmarks (from BENCH_SAMPLE_SIZE env var, defaults to 100)
    pub sample_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            use_redis: matches!(env::var("BENCH_REDIS").as_deref(), Ok("1") | Ok("true")),
            backend_latency: Duration::from_micros(
                env::var("BENCH_BACKEND_LATENCY_US")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            ),
            db_latency_ms: env::var("DB_LATENCY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
            sample_size: env::var("BENCH_SAMPLE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self {
        let config = Self::default();
        eprintln!("Benchmark Configuration:");
        eprintln!(
            "  Backend: {}",
            if config.use_redis { "redis" } else { "memory" }
        );
        eprintln!("  Backend Latency: {:?}", config.backend_latency);
        eprintln!("  DB Latency: {}ms", config.db_latency_ms);
        eprintln!("  Sample Size: {}", config.sample_size);
        config
    }
}
