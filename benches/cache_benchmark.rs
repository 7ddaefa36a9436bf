use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;
use tiered_swr_cache::{
    Cache, CacheConfig, CachePolicy, ConnectionConfig, MemoryBackend, MemoryBackendConfig,
};
use tokio::runtime::Runtime;

mod common;
use common::{BenchConfig, BenchMeeting, FakeDatabase, KeyGenerator};

/// Build a cache with or without the in-process tier. Each call gets its own
/// key prefix so runs do not see each other's entries.
async fn setup_cache(config: &BenchConfig, prefix: &str, with_l1: bool) -> Cache {
    let builder = Cache::builder().config(CacheConfig::default().with_key_prefix(prefix));
    let builder = if with_l1 {
        builder
    } else {
        builder.without_l1()
    };

    if config.use_redis {
        builder
            .connect_redis(ConnectionConfig::from_env().expect("invalid CACHE_REDIS_URL"))
            .await
            .expect("Redis connection failed")
    } else {
        builder.build(Arc::new(MemoryBackend::new(MemoryBackendConfig {
            latency: Some(config.backend_latency),
        })))
    }
}

async fn load(cache: &Cache, db: &FakeDatabase, key: &str, policy: &CachePolicy) {
    let db = db.clone();
    let result = cache
        .get_or_set(
            key,
            move |k: String| async move { db.get(&k).await },
            policy,
        )
        .await;
    let _: Result<BenchMeeting, _> = black_box(result);
}

/// Benchmark 1: Hot Cache (all hits, pure cache read performance)
fn bench_hot_cache(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hot_cache");
    group.sample_size(config.sample_size);

    let db = FakeDatabase::new(1000, 0);
    let keys = KeyGenerator::new(1000).sequential();
    let policy = CachePolicy::default();
    group.throughput(Throughput::Elements(keys.len() as u64));

    for with_l1 in [true, false] {
        let name = if with_l1 { "moka_l2" } else { "l2_only" };
        let cache = rt.block_on(async {
            let cache = setup_cache(config, &format!("bench-hot-{}", name), with_l1).await;
            for key in &keys {
                load(&cache, &db, key, &policy).await;
            }
            cache
        });

        group.bench_with_input(BenchmarkId::new(name, keys.len()), &keys, |b, keys| {
            b.to_async(&rt).iter(|| async {
                for key in keys {
                    black_box(cache.get::<BenchMeeting>(key).await);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 2: Cold Cache (every read goes to the origin)
fn bench_cold_cache(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cold_cache");
    group.sample_size(config.sample_size.min(20));
    group.measurement_time(Duration::from_secs(30));

    let db = FakeDatabase::new(1000, config.db_latency_ms);
    let keys = KeyGenerator::new(1000).sequential();
    let policy = CachePolicy::default();
    let cache = rt.block_on(setup_cache(config, "bench-cold", true));

    group.bench_function("moka_l2", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            let db = db.clone();
            let keys = keys.clone();
            let policy = policy.clone();
            async move {
                for key in keys.iter().take(10) {
                    let _ = cache.delete(key).await;
                    load(&cache, &db, key, &policy).await;
                }
            }
        });
    });

    group.finish();
}

/// Benchmark 3: Concurrent cold reads of one key (one origin call per burst)
fn bench_deduplicated_burst(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dedup_burst");
    group.sample_size(config.sample_size.min(20));

    let db = FakeDatabase::new(10, config.db_latency_ms);
    let policy = CachePolicy::default();
    let cache = rt.block_on(setup_cache(config, "bench-burst", true));

    for callers in [8usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(callers), &callers, |b, &n| {
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                let db = db.clone();
                let policy = policy.clone();
                async move {
                    let _ = cache.delete("meeting:1").await;
                    let burst = (0..n).map(|_| load(&cache, &db, "meeting:1", &policy));
                    futures::future::join_all(burst).await;
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 4: Skewed workload with short TTLs, so stale reads and
/// background refreshes show up alongside hits
fn bench_mixed_workload(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("mixed_workload");
    group.sample_size(config.sample_size.min(50));

    let db = FakeDatabase::new(500, config.db_latency_ms);
    let key_gen = KeyGenerator::new(500);
    let policy = CachePolicy::new(Duration::from_millis(200)).with_swr_window(Duration::from_secs(5));
    let cache = rt.block_on(setup_cache(config, "bench-mixed", true));

    group.bench_function("moka_l2", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            let db = db.clone();
            let keys = key_gen.skewed(50);
            let policy = policy.clone();
            async move {
                for key in &keys {
                    load(&cache, &db, key, &policy).await;
                }
            }
        });
    });

    group.finish();
}

fn run_benchmarks(c: &mut Criterion) {
    let config = BenchConfig::new();

    eprintln!("\n=== Running Benchmarks ===\n");

    bench_hot_cache(c, &config);
    bench_cold_cache(c, &config);
    bench_deduplicated_burst(c, &config);
    bench_mixed_workload(c, &config);
}

criterion_group!(benches, run_benchmarks);
criterion_main!(benches);
