use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use prometric::{
    encoding, HeapRegion, Label, LocalStorage, MetricKey, Region, SampleKind, SharedStorage,
    Storage,
};

fn request_key() -> MetricKey {
    MetricKey::new(
        SampleKind::Counter,
        "app:requests_total",
        "",
        vec![
            Label::new("env_name", "production"),
            Label::new("handler", "/api/v1/items"),
        ],
    )
}

fn bench_encode_key(criterion: &mut Criterion) {
    let key = request_key();
    let mut buf = Vec::with_capacity(128);
    criterion.bench_function("encode_key", |b| {
        b.iter(|| {
            buf.clear();
            encoding::encode_key(&key, &mut buf).unwrap();
            criterion::black_box(&buf[..]);
        })
    });
}

fn bench_local_inc(criterion: &mut Criterion) {
    let storage = LocalStorage::new();
    let key = request_key();
    criterion.bench_function("local_inc", |b| {
        b.iter(|| criterion::black_box(storage.inc(&key, 1.0).unwrap()))
    });
}

fn bench_shared_inc(criterion: &mut Criterion) {
    let region = Arc::new(HeapRegion::new(64 * 1024));
    let storage = SharedStorage::attach(region as Arc<dyn Region>).unwrap();
    let key = request_key();
    criterion.bench_function("shared_inc", |b| {
        b.iter(|| criterion::black_box(storage.inc(&key, 1.0).unwrap()))
    });
}

fn bench_shared_inc_batch(criterion: &mut Criterion) {
    let region = Arc::new(HeapRegion::new(256 * 1024));
    let storage = SharedStorage::attach(region as Arc<dyn Region>).unwrap();
    let items: Vec<(MetricKey, f64)> = (0..100)
        .map(|i| {
            (
                MetricKey::new(
                    SampleKind::Counter,
                    format!("metric_{i}"),
                    "",
                    vec![Label::new("env_name", "production")],
                ),
                1.0,
            )
        })
        .collect();
    criterion.bench_function("shared_inc_batch_100", |b| {
        b.iter(|| storage.inc_batch(criterion::black_box(&items)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode_key,
    bench_local_inc,
    bench_shared_inc,
    bench_shared_inc_batch,
);
criterion_main!(benches);
