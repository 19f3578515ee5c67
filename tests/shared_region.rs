//! End-to-end tests over a file-backed region: multiple attachments, index
//! invalidation, concurrent increments and flush semantics.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use prometric::{
    Counter, FlushStorage, Label, LabelValue, MetricKey, MmapRegion, Region, Registry, SampleKind,
    SharedStorage, SharedStorageStats, Storage, registry_to_text,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn attach(path: &Path) -> SharedStorage {
    let region = Arc::new(MmapRegion::open(path).unwrap());
    SharedStorage::attach(region as Arc<dyn Region>).unwrap()
}

fn counter_key(name: &str) -> MetricKey {
    MetricKey::new(SampleKind::Counter, name, "", vec![])
}

#[test]
fn fresh_region_initializes_to_header_only() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    let region = Arc::new(MmapRegion::create(&path, 409600).unwrap());

    let storage = SharedStorage::attach(region.clone() as Arc<dyn Region>).unwrap();
    assert_eq!(storage.area_size(), 14);
    assert_eq!(storage.len(), 0);

    let mut byte = [0xFFu8; 1];
    region.read(15, &mut byte);
    assert_eq!(byte[0], 0x00);
}

#[test]
fn later_process_sees_earlier_writes() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 4096).unwrap();

    let a = attach(&path);
    let key = counter_key("k");
    a.inc(&key, 5.0).unwrap();

    // Attached only after the write; reconciles on its first operation.
    let b = attach(&path);
    assert_eq!(b.get(&key).unwrap(), 5.0);
}

#[test]
fn sign_change_forces_sibling_reconcile() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 4096).unwrap();

    let a = attach(&path);
    let b = attach(&path);
    assert_eq!(b.len(), 0);

    let key = counter_key("k1");
    a.inc(&key, 1.0).unwrap();
    assert_eq!(b.len(), 0);

    assert_eq!(b.get(&key).unwrap(), 1.0);
    assert_eq!(b.len(), 1);
}

#[test]
fn concurrent_increments_sum_exactly() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 409600).unwrap();

    const WORKERS: usize = 8;
    const ITERATIONS: usize = 250;
    let key = counter_key("contended");

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let path = path.clone();
            let key = key.clone();
            thread::spawn(move || {
                // Each worker attaches independently, like a forked child.
                let storage = attach(&path);
                for _ in 0..ITERATIONS {
                    storage.inc(&key, 1.0).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let observer = attach(&path);
    assert_eq!(
        observer.get(&key).unwrap(),
        (WORKERS * ITERATIONS) as f64
    );
}

#[test]
fn concurrent_appends_of_distinct_keys_all_land() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 409600).unwrap();

    const WORKERS: usize = 4;
    const KEYS: usize = 25;

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let path = path.clone();
            thread::spawn(move || {
                let storage = attach(&path);
                for i in 0..KEYS {
                    storage.inc(&counter_key(&format!("w{worker}_k{i}")), 1.0).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let observer = attach(&path);
    assert_eq!(observer.iterate().len(), WORKERS * KEYS);
    for worker in 0..WORKERS {
        for i in 0..KEYS {
            let key = counter_key(&format!("w{worker}_k{i}"));
            assert_eq!(observer.get(&key).unwrap(), 1.0);
        }
    }
}

#[test]
fn clear_resets_every_attachment() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 4096).unwrap();

    let a = attach(&path);
    let b = attach(&path);
    let key = counter_key("k");
    a.inc(&key, 3.0).unwrap();
    assert_eq!(b.get(&key).unwrap(), 3.0);

    a.clear();
    assert_eq!(a.area_size(), 0);
    assert_eq!(b.area_size(), 0);

    // The next lock-taking operation restores the header.
    assert_eq!(b.get(&key).unwrap(), 0.0);
    assert_eq!(b.area_size(), 14);
    assert_eq!(b.len(), 0);
}

#[test]
fn flush_storage_drains_into_the_shared_table() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 409600).unwrap();

    let storage = FlushStorage::new(Arc::new(attach(&path)));
    let key = counter_key("k");

    for _ in 0..10 {
        storage.inc(&key, 1.0).unwrap();
    }
    assert_eq!(storage.get(&key).unwrap(), 0.0);

    storage.flush().unwrap();
    assert_eq!(storage.get(&key).unwrap(), 10.0);
    assert!(storage.pending().is_empty());

    // A second flush with an empty buffer changes nothing.
    storage.flush().unwrap();
    assert_eq!(storage.get(&key).unwrap(), 10.0);
}

#[test]
fn flush_storages_from_many_workers_merge_additively() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 409600).unwrap();

    const WORKERS: usize = 4;
    const ROUNDS: usize = 50;
    let key = counter_key("k");

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let path = path.clone();
            let key = key.clone();
            thread::spawn(move || {
                let storage = FlushStorage::new(Arc::new(attach(&path)));
                for _ in 0..ROUNDS {
                    storage.inc(&key, 1.0).unwrap();
                    storage.flush().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let observer = attach(&path);
    assert_eq!(observer.get(&key).unwrap(), (WORKERS * ROUNDS) as f64);
}

#[test]
fn tiny_region_drops_overflowing_appends() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    // Room for the header and not much else.
    MmapRegion::create(&path, 64).unwrap();

    let storage = attach(&path);
    let fits = counter_key("a");
    assert_eq!(storage.inc(&fits, 2.0).unwrap(), 2.0);

    let overflow = counter_key(&"x".repeat(64));
    // Dropped with a sentinel, never an error.
    assert_eq!(storage.inc(&overflow, 1.0).unwrap(), 0.0);
    assert_eq!(storage.get(&overflow).unwrap(), 0.0);
    assert_eq!(storage.get(&fits).unwrap(), 2.0);
}

#[test]
fn registry_exports_shared_samples_and_storage_stats() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.region");
    MmapRegion::create(&path, 409600).unwrap();

    let shared = Arc::new(attach(&path));
    let registry = Registry::new(shared.clone() as Arc<dyn Storage>);

    let requests = Counter::with_registry(
        "app:requests_total",
        "Total processed requests",
        &["env_name"],
        &registry,
    )
    .unwrap();
    requests
        .labels(&[("env_name", LabelValue::from("test"))])
        .unwrap()
        .inc(3.0);

    registry
        .register(Arc::new(SharedStorageStats::new(
            shared.clone(),
            "namespace",
            vec![Label::new("sharedarea", LabelValue::Int(0))],
        )))
        .unwrap();

    let text = registry_to_text(&registry);
    assert!(text.contains("# TYPE app:requests_total counter"));
    assert!(text.contains("app:requests_total{env_name=\"test\"} 3.0"));
    assert!(text.contains("namespace:memory_size{sharedarea=\"0\"}"));
    assert!(text.contains("namespace:num_keys{sharedarea=\"0\"} 1.0"));
}
