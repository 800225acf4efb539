use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dynamo_lite::{CausalStore, HashRing};
use serde_json::json;

fn bench_put_single(c: &mut Criterion) {
    let store = CausalStore::new("bench".to_string());
    c.bench_function("put_single", |b| {
        b.iter(|| {
            black_box(
                store
                    .put(
                        "key1",
                        json!({"name": "Alice", "age": 30, "email": "alice@example.com"}),
                    )
                    .unwrap(),
            )
        })
    });
}

fn bench_put_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_sequential");
    for size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let store = CausalStore::new("bench".to_string());
                for i in 0..size {
                    black_box(store.put(&format!("key-{i}"), json!(i)).unwrap());
                }
            })
        });
    }
    group.finish();
}

fn bench_ring_owner_lookup(c: &mut Criterion) {
    let ring = HashRing::new();
    for i in 0..10 {
        ring.add(&format!("node-{i}"));
    }
    c.bench_function("ring_owner_lookup", |b| {
        b.iter(|| black_box(ring.owner("some-key-to-look-up")))
    });
}

fn bench_detect_conflicts(c: &mut Criterion) {
    let store = CausalStore::new("bench".to_string());
    for i in 0..50 {
        store.put(&format!("key-{i}"), json!(i)).unwrap();
    }
    c.bench_function("detect_conflicts_no_conflicts", |b| {
        b.iter(|| black_box(store.detect_conflicts()))
    });
}

criterion_group!(
    benches,
    bench_put_single,
    bench_put_sequential,
    bench_ring_owner_lookup,
    bench_detect_conflicts
);
criterion_main!(benches);
