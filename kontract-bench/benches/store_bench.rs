//! Shared storage and gateway dispatch benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kontract_core::{EventBus, RouteTable, TransactionManager};
use kontract_server::{register_state_routes, RpcGateway};
use kontract_storage::{MemoryRemote, SharedStorage, StorageConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

// Keeps keys unique across benchmark iterations
static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_key(prefix: &str) -> String {
    format!("{}{}", prefix, KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn create_storage() -> Arc<SharedStorage> {
    Arc::new(SharedStorage::from_remote(
        Arc::new(MemoryRemote::new()),
        &StorageConfig::default(),
    ))
}

fn bench_hot_tier(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let storage = create_storage();
    let mut group = c.benchmark_group("storage_hot");
    group.throughput(Throughput::Elements(1));

    rt.block_on(storage.set("session:cached", json!({"owner": "bench"}), None))
        .unwrap();

    group.bench_function("get_local_hit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(storage.get("session:cached").await.unwrap()) });
    });

    group.bench_function("set_write_through", |b| {
        b.to_async(&rt).iter(|| async {
            let key = next_key("session:");
            black_box(storage.set(&key, json!({"n": 1}), None).await.unwrap())
        });
    });

    group.finish();
}

fn bench_cold_tier(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let storage = create_storage();
    let mut group = c.benchmark_group("storage_cold");
    group.throughput(Throughput::Elements(1));

    rt.block_on(storage.set("todo:cached", json!({"title": "milk"}), None))
        .unwrap();

    group.bench_function("get", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(storage.get("todo:cached").await.unwrap()) });
    });

    group.bench_function("set", |b| {
        b.to_async(&rt).iter(|| async {
            let key = next_key("todo:");
            black_box(storage.set(&key, json!({"title": "x"}), None).await.unwrap())
        });
    });

    group.finish();
}

fn bench_gateway_call(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let storage = create_storage();
    let mut routes = RouteTable::new();
    register_state_routes(&mut routes, storage.clone(), EventBus::new()).unwrap();
    let gateway = RpcGateway::new(
        Arc::new(routes),
        Arc::new(TransactionManager::new(storage)),
    );

    let mut headers = HashMap::new();
    headers.insert("x-owner".to_string(), "bench".to_string());

    let mut group = c.benchmark_group("gateway_call");
    group.throughput(Throughput::Elements(1));

    group.bench_function("state_set", |b| {
        b.to_async(&rt).iter(|| async {
            let key = next_key("todo:");
            black_box(
                gateway
                    .call("state.set", &headers, json!([key, {"done": false}]))
                    .await,
            )
        });
    });

    group.bench_function("unknown_route", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(gateway.call("missing", &headers, json!([])).await) });
    });

    group.finish();
}

criterion_group!(benches, bench_hot_tier, bench_cold_tier, bench_gateway_call);
criterion_main!(benches);
