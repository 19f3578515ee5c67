//! Flush storage: an in-process write buffer in front of a shared table.

use std::sync::Arc;

use crate::key::MetricKey;
use crate::shared::SharedStorage;
use crate::storage::{LocalStorage, Record, Storage};
use crate::StorageError;

/// A two-tier storage that buffers increments in process-local memory and
/// merges them into a shared table in batches, amortizing region lock
/// contention when many small increments are issued per request.
///
/// Writes go to the local map; reads go to the shared table so that
/// cross-process aggregates stay observable. [`flush`](FlushStorage::flush)
/// drains the local map through a single `inc_batch`.
///
/// Because flushing merges by addition, only `inc`-style aggregation is
/// safe through this storage: a `set` issued from several processes would
/// lose interleaved writes, so gauges routed here must be dominated by a
/// single writer process.
pub struct FlushStorage {
    local: LocalStorage,
    shared: Arc<SharedStorage>,
}

impl FlushStorage {
    pub fn new(shared: Arc<SharedStorage>) -> FlushStorage {
        FlushStorage {
            local: LocalStorage::new(),
            shared,
        }
    }

    /// The shared table behind the write buffer.
    pub fn persistent_storage(&self) -> &Arc<SharedStorage> {
        &self.shared
    }

    /// The buffered, not-yet-flushed increments.
    pub fn pending(&self) -> Vec<Record> {
        self.local.iterate()
    }

    /// Merges every buffered increment into the shared table with one batch
    /// operation, then empties the buffer.
    pub fn flush(&self) -> Result<(), StorageError> {
        let items = self.local.iterate();
        self.shared.inc_batch(&items)?;
        self.local.clear();
        Ok(())
    }
}

impl Storage for FlushStorage {
    fn inc(&self, key: &MetricKey, delta: f64) -> Result<f64, StorageError> {
        self.local.inc(key, delta)
    }

    fn set(&self, key: &MetricKey, value: f64) -> Result<f64, StorageError> {
        self.local.set(key, value)
    }

    fn get(&self, key: &MetricKey) -> Result<f64, StorageError> {
        self.shared.get(key)
    }

    fn inc_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        self.local.inc_batch(items)
    }

    fn set_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        self.local.set_batch(items)
    }

    fn iterate(&self) -> Vec<Record> {
        self.shared.iterate()
    }

    fn len(&self) -> usize {
        self.shared.len()
    }

    fn clear(&self) {
        self.shared.clear();
        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{MetricKey, SampleKind};
    use crate::region::{HeapRegion, Region};

    fn flush_storage() -> (Arc<HeapRegion>, FlushStorage) {
        let region = Arc::new(HeapRegion::new(64 * 1024));
        let shared =
            Arc::new(SharedStorage::attach(region.clone() as Arc<dyn Region>).unwrap());
        (region, FlushStorage::new(shared))
    }

    fn key(name: &str) -> MetricKey {
        MetricKey::new(SampleKind::Counter, name, "", vec![])
    }

    #[test]
    fn increments_buffer_locally_until_flush() {
        let (_region, storage) = flush_storage();
        let k = key("k");

        for _ in 0..10 {
            storage.inc(&k, 1.0).unwrap();
        }
        // Reads go to the shared table, which has seen nothing yet.
        assert_eq!(storage.get(&k).unwrap(), 0.0);
        assert_eq!(storage.pending(), vec![(k.clone(), 10.0)]);

        storage.flush().unwrap();
        assert_eq!(storage.get(&k).unwrap(), 10.0);
        assert_eq!(storage.persistent_storage().get(&k).unwrap(), 10.0);
        assert!(storage.pending().is_empty());
    }

    #[test]
    fn flushes_merge_additively_across_buffers() {
        let region = Arc::new(HeapRegion::new(64 * 1024));
        let a = FlushStorage::new(Arc::new(
            SharedStorage::attach(region.clone() as Arc<dyn Region>).unwrap(),
        ));
        let b = FlushStorage::new(Arc::new(
            SharedStorage::attach(region.clone() as Arc<dyn Region>).unwrap(),
        ));
        let k = key("k");

        for _ in 0..4 {
            a.inc(&k, 1.0).unwrap();
            b.inc(&k, 2.0).unwrap();
        }
        a.flush().unwrap();
        b.flush().unwrap();

        assert_eq!(a.get(&k).unwrap(), 12.0);
        assert_eq!(b.get(&k).unwrap(), 12.0);
    }

    #[test]
    fn clear_empties_both_tiers() {
        let (_region, storage) = flush_storage();
        let k = key("k");

        storage.inc(&k, 1.0).unwrap();
        storage.flush().unwrap();
        storage.inc(&k, 1.0).unwrap();

        storage.clear();
        assert!(storage.pending().is_empty());
        assert_eq!(storage.len(), 0);
        assert_eq!(storage.persistent_storage().area_size(), 0);
    }
}
