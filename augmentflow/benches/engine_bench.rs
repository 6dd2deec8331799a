//! Benchmarks for partitioning and the cache hot path.

use augmentflow::cache::{CacheConfig, FetchCache};
use augmentflow::work::{partition_items, WorkItem};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn partition_benchmark(c: &mut Criterion) {
    let items: Vec<WorkItem> = (0..10_000)
        .map(|i| WorkItem::new(format!("item-{i}")))
        .collect();

    c.bench_function("partition_10k_items", |b| {
        b.iter(|| black_box(partition_items(items.clone(), 32)))
    });
}

fn cache_benchmark(c: &mut Criterion) {
    let cache = FetchCache::new(CacheConfig::new().without_ttl().with_max_entries(4096));
    for i in 0..1_000 {
        cache.put("bench", &format!("item-{i}"), serde_json::json!(i));
    }

    c.bench_function("cache_hit", |b| {
        b.iter(|| black_box(cache.get("bench", "item-500")))
    });

    c.bench_function("cache_miss", |b| {
        b.iter(|| black_box(cache.get("bench", "absent")))
    });
}

criterion_group!(benches, partition_benchmark, cache_benchmark);
criterion_main!(benches);
