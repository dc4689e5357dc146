//! Benchmarks for the in-process engine
//!
//! This benchmark suite measures the performance of:
//! - Hits and misses
//! - Inserts under eviction pressure
//! - Namespace purges
//! - A full read-through hit via `ModelCache`

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hybrid_model_cache::async_trait;
use hybrid_model_cache::{
    CacheConfig, CacheSystem, CachedModel, LocalCache, ModelStore, Query, Filter,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const TTL: Duration = Duration::from_secs(300);

fn filled(capacity: usize) -> LocalCache {
    let cache = LocalCache::new(capacity);
    for i in 0..capacity {
        cache.set(&format!("v1:Bench:{i}"), Some(json!({"id": i})), TTL);
    }
    cache
}

fn bench_get(c: &mut Criterion) {
    let cache = filled(10_000);

    c.bench_function("local_get_hit", |b| {
        b.iter(|| cache.get(black_box("v1:Bench:5000")));
    });
    c.bench_function("local_get_miss", |b| {
        b.iter(|| cache.get(black_box("v1:Bench:missing")));
    });
}

/// Every insert beyond capacity evicts the oldest entry
fn bench_set_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_set_evicting");

    for capacity in &[100usize, 1_000, 10_000] {
        let cache = filled(*capacity);
        let mut next = *capacity;
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, _| {
            b.iter(|| {
                next += 1;
                cache.set(&format!("v1:Bench:{next}"), Some(json!({"id": next})), TTL);
            });
        });
    }

    group.finish();
}

fn bench_purge(c: &mut Criterion) {
    c.bench_function("local_purge_namespace_1000", |b| {
        b.iter_batched(
            || filled(1_000),
            |cache| cache.purge_prefix(black_box("v1:Bench:"), &[]),
            criterion::BatchSize::SmallInput,
        );
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    id: i64,
    name: String,
}

impl CachedModel for Row {
    const NAME: &'static str = "Row";
}

struct StaticStore;

#[async_trait]
impl ModelStore<Row> for StaticStore {
    async fn find_one(&self, _query: &Query) -> anyhow::Result<Option<Row>> {
        Ok(Some(Row {
            id: 1,
            name: "row".to_string(),
        }))
    }

    async fn find_all(&self, _query: &Query) -> anyhow::Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn find_or_create(&self, query: &Query, _defaults: &Value) -> anyhow::Result<(Row, bool)> {
        Ok((self.find_one(query).await?.unwrap_or_else(|| panic!("static row")), false))
    }

    async fn count(&self, _query: &Query) -> anyhow::Result<u64> {
        Ok(1)
    }

    async fn save(&self, instance: &Row) -> anyhow::Result<Row> {
        Ok(instance.clone())
    }

    async fn destroy(&self, _instance: &Row) -> anyhow::Result<()> {
        Ok(())
    }

    async fn bulk_create(&self, instances: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        Ok(instances)
    }

    async fn bulk_update(&self, _query: &Query, _patch: &Value) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn bulk_destroy(&self, _query: &Query) -> anyhow::Result<u64> {
        Ok(0)
    }
}

/// Cached `get_one`: normalize, lookup, rehydrate
fn bench_read_through_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let cache = rt.block_on(async {
        CacheSystem::new(CacheConfig::default())
            .await
            .unwrap_or_else(|_| panic!("Failed to create cache system"))
    });
    let rows = cache.model::<Row, _>(Arc::new(StaticStore));
    let query = Query::new(Filter::new().eq("id", 1));
    rt.block_on(async {
        rows.get_one(&query).await.unwrap_or_else(|_| panic!("warmup failed"));
    });

    c.bench_function("model_get_one_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(rows.get_one(&query).await.unwrap_or_else(|_| panic!("get_one failed")));
            });
        });
    });
}

criterion_group!(
    benches,
    bench_get,
    bench_set_with_eviction,
    bench_purge,
    bench_read_through_hit
);
criterion_main!(benches);
