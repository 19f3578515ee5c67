//! The shared counter table: a typed key/value store laid out inside a
//! fixed-size region that many independent processes attach and mutate.
//!
//! The region starts with a 14-byte header (`used` byte count and a 10-byte
//! random `sign`) followed by append-only records. Values are mutated in
//! place; appending a key or clearing the region rewrites the sign. Every
//! attached storage keeps a private offset index and rebuilds it whenever
//! the region's sign no longer matches its cached copy, which is how a
//! process observes keys appended by its siblings without a coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::encoding::{self, HEADER_LEN, KEY_LEN_LEN, SIGN_LEN, SIGN_OFFSET, USED_OFFSET, VALUE_LEN};
use crate::key::{Label, MetricKey, SampleKind};
use crate::region::Region;
use crate::registry::{Collector, MetricFamily, MetricKind, Sample, Snapshot};
use crate::storage::{Record, Storage};
use crate::{DecodeError, StorageError};

/// Byte offsets of one record within the region: record start, key bytes
/// start, value start, record end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Offsets {
    record: usize,
    key: usize,
    value: usize,
    end: usize,
}

#[derive(Default)]
struct Inner {
    /// Cached copy of the header's `used` field.
    used: usize,
    /// Cached copy of the header's `sign` field.
    sign: [u8; SIGN_LEN],
    /// Private positional index over the region's records.
    index: HashMap<Vec<u8>, Offsets>,
    /// Memoized canonical encodings of structured keys.
    key_cache: HashMap<MetricKey, Arc<Vec<u8>>>,
    /// Whether the current logical operation already holds the region's
    /// write (resp. read) lock; nested acquisitions are elided.
    wlocked: bool,
    rlocked: bool,
}

/// A storage backed by a shared region.
///
/// Many storages (across any number of processes) may attach to the same
/// region. All operations take the region's advisory lock and reconcile the
/// private index against the region's sign before touching records.
///
/// Region exhaustion and lock failures never surface to recording paths:
/// they are logged and the operation returns its sentinel (0.0 for `inc`,
/// no-op for `set`).
pub struct SharedStorage {
    region: Arc<dyn Region>,
    inner: Mutex<Inner>,
}

impl SharedStorage {
    /// Attaches to a region, initializing its header if this is the first
    /// attachment ever (or the first since a clear).
    pub fn attach(region: Arc<dyn Region>) -> Result<SharedStorage, StorageError> {
        if region.capacity() < HEADER_LEN {
            return Err(StorageError::Exhausted {
                required: HEADER_LEN,
                capacity: region.capacity(),
            });
        }
        let storage = SharedStorage {
            region,
            inner: Mutex::new(Inner::default()),
        };
        {
            let mut inner = storage.inner.lock();
            storage.with_wlock(&mut inner, |s, inner| s.reconcile(inner))?;
        }
        Ok(storage)
    }

    /// Bytes of the region currently occupied, header included. 0 means the
    /// region is uninitialized (fresh or cleared).
    pub fn area_size(&self) -> usize {
        let mut inner = self.inner.lock();
        match self.with_rlock(&mut inner, |s, _inner| Ok(s.read_used())) {
            Ok(used) => used,
            Err(err) => {
                log::error!("failed to read region header: {err}");
                0
            }
        }
    }

    /// Number of keys in the private index. Reconciled lazily: the count
    /// reflects the last operation that took the region lock.
    pub fn num_keys(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Runs `f` under the region's write lock, eliding the acquisition when
    /// the current logical operation already holds it. The lock is released
    /// on every exit path.
    fn with_wlock<T>(
        &self,
        inner: &mut Inner,
        f: impl FnOnce(&SharedStorage, &mut Inner) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        if inner.wlocked {
            return f(self, inner);
        }
        self.region.wlock().map_err(StorageError::Lock)?;
        inner.wlocked = true;
        inner.rlocked = true;
        let out = f(self, inner);
        inner.wlocked = false;
        inner.rlocked = false;
        self.region.unlock();
        out
    }

    /// As [`with_wlock`](Self::with_wlock), for the shared lock.
    fn with_rlock<T>(
        &self,
        inner: &mut Inner,
        f: impl FnOnce(&SharedStorage, &mut Inner) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        if inner.rlocked {
            return f(self, inner);
        }
        self.region.rlock().map_err(StorageError::Lock)?;
        inner.rlocked = true;
        let out = f(self, inner);
        inner.rlocked = false;
        self.region.unlock();
        out
    }

    fn read_used(&self) -> usize {
        let mut bytes = [0u8; 4];
        self.region.read(USED_OFFSET, &mut bytes);
        u32::from_le_bytes(bytes) as usize
    }

    fn write_used(&self, inner: &mut Inner, used: usize) {
        self.region.write(USED_OFFSET, &(used as u32).to_le_bytes());
        inner.used = used;
    }

    fn read_sign(&self) -> [u8; SIGN_LEN] {
        let mut sign = [0u8; SIGN_LEN];
        self.region.read(SIGN_OFFSET, &mut sign);
        sign
    }

    fn write_fresh_sign(&self, inner: &mut Inner) {
        let mut sign = [0u8; SIGN_LEN];
        OsRng.fill_bytes(&mut sign);
        self.region.write(SIGN_OFFSET, &sign);
        inner.sign = sign;
    }

    fn read_value_at(&self, offset: usize) -> f64 {
        let mut bytes = [0u8; VALUE_LEN];
        self.region.read(offset, &mut bytes);
        f64::from_le_bytes(bytes)
    }

    fn write_value_at(&self, offset: usize, value: f64) {
        self.region.write(offset, &value.to_le_bytes());
    }

    /// Brings the private index up to date with the region. Must run under
    /// the write lock: an uninitialized region is initialized here, and a
    /// corrupt record area is repaired in place.
    ///
    /// Idempotent; a second call with no intervening mutation is a no-op.
    fn reconcile(&self, inner: &mut Inner) -> Result<(), StorageError> {
        let used = self.read_used();
        if used == 0 {
            self.write_used(inner, HEADER_LEN);
            self.write_fresh_sign(inner);
            inner.index.clear();
            return Ok(());
        }

        let sign = self.read_sign();
        if sign == inner.sign {
            return Ok(());
        }

        if let Err(err) = self.rebuild_index(inner, used, sign) {
            // We hold the write lock, so repair rather than abort.
            log::error!("shared region corrupt, reinitializing: {err}");
            inner.index.clear();
            self.write_used(inner, HEADER_LEN);
            self.write_fresh_sign(inner);
        }
        Ok(())
    }

    /// Re-scans `[HEADER_LEN, used)` record by record and rebuilds the
    /// offset index.
    fn rebuild_index(
        &self,
        inner: &mut Inner,
        used: usize,
        sign: [u8; SIGN_LEN],
    ) -> Result<(), DecodeError> {
        if used < HEADER_LEN || used > self.region.capacity() {
            return Err(DecodeError::new(format!("header used out of range: {used}")));
        }

        let mut area = vec![0u8; used - HEADER_LEN];
        self.region.read(HEADER_LEN, &mut area);

        let mut index = HashMap::new();
        let mut pos = 0;
        while pos < area.len() {
            if area.len() - pos < KEY_LEN_LEN + VALUE_LEN {
                return Err(DecodeError::new("truncated record header"));
            }
            let key_len =
                u32::from_le_bytes(area[pos..pos + KEY_LEN_LEN].try_into().expect("4 bytes"))
                    as usize;
            let room = area.len() - pos - KEY_LEN_LEN - VALUE_LEN;
            if key_len == 0 || key_len > room {
                return Err(DecodeError::new(format!(
                    "record key length {key_len} runs past used"
                )));
            }
            let record = HEADER_LEN + pos;
            let key = record + KEY_LEN_LEN;
            let value = key + key_len;
            let end = value + VALUE_LEN;
            let key_bytes = area[pos + KEY_LEN_LEN..pos + KEY_LEN_LEN + key_len].to_vec();
            let offsets = Offsets { record, key, value, end };
            if let Some(stale) = index.insert(key_bytes, offsets) {
                log::warn!(
                    "duplicate key at records {} and {}; keeping the later one",
                    stale.record,
                    offsets.record,
                );
            }
            pos = offsets.end - HEADER_LEN;
        }

        inner.index = index;
        inner.used = used;
        inner.sign = sign;
        Ok(())
    }

    /// Appends a fresh record, then rewrites `used` and `sign`, in that
    /// order, all while the caller holds the write lock.
    fn append(
        &self,
        inner: &mut Inner,
        key_bytes: &[u8],
        value: f64,
    ) -> Result<Offsets, StorageError> {
        let record_len = encoding::record_len(key_bytes.len());
        let new_used = inner.used + record_len;
        if new_used > self.region.capacity() {
            return Err(StorageError::Exhausted {
                required: new_used,
                capacity: self.region.capacity(),
            });
        }

        let mut buf = Vec::with_capacity(record_len);
        encoding::encode_record(key_bytes, value, &mut buf);
        let record = inner.used;
        self.region.write(record, &buf);
        self.write_used(inner, new_used);
        self.write_fresh_sign(inner);

        let key = record + KEY_LEN_LEN;
        let offsets = Offsets {
            record,
            key,
            value: key + key_bytes.len(),
            end: new_used,
        };
        inner.index.insert(key_bytes.to_vec(), offsets);
        Ok(offsets)
    }

    fn inc_at(&self, inner: &mut Inner, key_bytes: &[u8], delta: f64) -> Result<f64, StorageError> {
        match inner.index.get(key_bytes).copied() {
            Some(offsets) => {
                let value = self.read_value_at(offsets.value) + delta;
                self.write_value_at(offsets.value, value);
                Ok(value)
            }
            None => {
                self.append(inner, key_bytes, delta)?;
                Ok(delta)
            }
        }
    }

    fn set_at(&self, inner: &mut Inner, key_bytes: &[u8], value: f64) -> Result<f64, StorageError> {
        match inner.index.get(key_bytes).copied() {
            Some(offsets) => {
                self.write_value_at(offsets.value, value);
                Ok(value)
            }
            None => {
                self.append(inner, key_bytes, value)?;
                Ok(value)
            }
        }
    }

    fn encode_cached(
        &self,
        inner: &mut Inner,
        key: &MetricKey,
    ) -> Result<Arc<Vec<u8>>, StorageError> {
        if let Some(bytes) = inner.key_cache.get(key) {
            return Ok(bytes.clone());
        }
        let bytes = Arc::new(encoding::encode_key_to_vec(key)?);
        inner.key_cache.insert(key.clone(), bytes.clone());
        Ok(bytes)
    }

    /// Applies a batch of mutations under one lock acquisition. Bad keys
    /// and exhausted appends are logged and skipped so the rest of the
    /// batch still lands.
    fn apply_batch(
        &self,
        items: &[Record],
        apply: fn(&SharedStorage, &mut Inner, &[u8], f64) -> Result<f64, StorageError>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in items {
            match self.encode_cached(&mut inner, key) {
                Ok(bytes) => encoded.push((bytes, *value)),
                Err(err) => log::error!("failed to encode key for batch: {err}"),
            }
        }
        let result = self.with_wlock(&mut inner, |s, inner| {
            s.reconcile(inner)?;
            for (bytes, value) in &encoded {
                if let Err(err) = apply(s, inner, bytes, *value) {
                    log::error!("dropping batched sample: {err}");
                }
            }
            Ok(())
        });
        match result {
            Err(StorageError::Lock(err)) => {
                log::error!("region lock unavailable, dropping batch: {err}");
                Ok(())
            }
            other => other,
        }
    }

    /// Converts region exhaustion and lock failures into the sentinel,
    /// logging them; recording paths never observe these errors.
    fn absorbed(result: Result<f64, StorageError>, sentinel: f64) -> Result<f64, StorageError> {
        match result {
            Err(StorageError::Exhausted { required, capacity }) => {
                log::error!(
                    "shared region exhausted (required: {required}, capacity: {capacity}); \
                     dropping sample"
                );
                Ok(sentinel)
            }
            Err(StorageError::Lock(err)) => {
                log::error!("region lock unavailable, dropping sample: {err}");
                Ok(sentinel)
            }
            other => other,
        }
    }
}

impl Storage for SharedStorage {
    fn inc(&self, key: &MetricKey, delta: f64) -> Result<f64, StorageError> {
        let mut inner = self.inner.lock();
        let key_bytes = self.encode_cached(&mut inner, key)?;
        let result = self.with_wlock(&mut inner, |s, inner| {
            s.reconcile(inner)?;
            s.inc_at(inner, &key_bytes, delta)
        });
        Self::absorbed(result, 0.0)
    }

    fn set(&self, key: &MetricKey, value: f64) -> Result<f64, StorageError> {
        let mut inner = self.inner.lock();
        let key_bytes = self.encode_cached(&mut inner, key)?;
        let result = self.with_wlock(&mut inner, |s, inner| {
            s.reconcile(inner)?;
            s.set_at(inner, &key_bytes, value)
        });
        Self::absorbed(result, 0.0)
    }

    fn get(&self, key: &MetricKey) -> Result<f64, StorageError> {
        let mut inner = self.inner.lock();
        let key_bytes = self.encode_cached(&mut inner, key)?;
        // The write lock also covers the lazy reconcile; a get never
        // creates the key.
        let result = self.with_wlock(&mut inner, |s, inner| {
            s.reconcile(inner)?;
            Ok(match inner.index.get(key_bytes.as_slice()) {
                Some(offsets) => s.read_value_at(offsets.value),
                None => 0.0,
            })
        });
        Self::absorbed(result, 0.0)
    }

    fn inc_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        self.apply_batch(items, SharedStorage::inc_at)
    }

    fn set_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        self.apply_batch(items, SharedStorage::set_at)
    }

    fn iterate(&self) -> Vec<Record> {
        let mut inner = self.inner.lock();
        let result = self.with_wlock(&mut inner, |s, inner| {
            s.reconcile(inner)?;
            let mut area = vec![0u8; inner.used - HEADER_LEN];
            s.region.read(HEADER_LEN, &mut area);
            Ok(area)
        });
        drop(inner);

        let area = match result {
            Ok(area) => area,
            Err(err) => {
                log::error!("failed to snapshot shared region: {err}");
                return Vec::new();
            }
        };

        // Decode outside the lock; the copy is structure-stable.
        let mut records = Vec::new();
        let mut pos = 0;
        while pos + KEY_LEN_LEN + VALUE_LEN <= area.len() {
            let key_len =
                u32::from_le_bytes(area[pos..pos + KEY_LEN_LEN].try_into().expect("4 bytes"))
                    as usize;
            if key_len == 0 || key_len > area.len() - pos - KEY_LEN_LEN - VALUE_LEN {
                break;
            }
            let key_start = pos + KEY_LEN_LEN;
            let value_start = key_start + key_len;
            let value = f64::from_le_bytes(
                area[value_start..value_start + VALUE_LEN]
                    .try_into()
                    .expect("8 bytes"),
            );
            match encoding::decode_key(&area[key_start..value_start]) {
                Ok(key) => records.push((key, value)),
                Err(err) => log::warn!("skipping undecodable key during iteration: {err}"),
            }
            pos = value_start + VALUE_LEN;
        }
        records
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        let result = self.with_wlock(&mut inner, |s, inner| {
            s.region.write(0, &[0u8; HEADER_LEN]);
            inner.used = 0;
            inner.sign = [0u8; SIGN_LEN];
            inner.index.clear();
            Ok(())
        });
        if let Err(err) = result {
            log::error!("failed to clear shared region: {err}");
        }
    }
}

/// Collector exporting a shared storage's own gauges: region bytes in use
/// and known key count.
///
/// The figures come from the storage's pure accessors, so the collector can
/// drive any registry without the storage referencing it back.
pub struct SharedStorageStats {
    storage: Arc<SharedStorage>,
    namespace: String,
    labels: Vec<Label>,
}

impl SharedStorageStats {
    pub fn new(
        storage: Arc<SharedStorage>,
        namespace: impl Into<String>,
        labels: Vec<Label>,
    ) -> SharedStorageStats {
        SharedStorageStats {
            storage,
            namespace: namespace.into(),
            labels,
        }
    }

    fn metric_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_owned()
        } else {
            format!("{}:{}", self.namespace, name)
        }
    }

    fn gauge_family(&self, name: &str, help: &str, value: f64) -> MetricFamily {
        let name = self.metric_name(name);
        MetricFamily {
            kind: MetricKind::Gauge,
            help: help.to_owned(),
            samples: vec![Sample {
                key: MetricKey::new(SampleKind::Gauge, name.clone(), "", self.labels.clone()),
                value,
            }],
            name,
        }
    }
}

impl Collector for SharedStorageStats {
    fn uid(&self) -> String {
        format!("shared-storage-stats:{}", self.namespace)
    }

    fn collect(&self, _snapshot: &Snapshot) -> Vec<MetricFamily> {
        vec![
            self.gauge_family(
                "memory_size",
                "Shared region bytes in use",
                self.storage.area_size() as f64,
            ),
            self.gauge_family(
                "num_keys",
                "Number of keys in the shared region",
                self.storage.num_keys() as f64,
            ),
        ]
    }
}
