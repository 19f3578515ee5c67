//! The storage facade and the in-process map storage.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::key::{Label, MetricKey};
use crate::StorageError;

/// One stored series and its current value.
pub type Record = (MetricKey, f64);

/// All records of one metric name that share the same grouping labels.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesGroup {
    pub labels: Vec<Label>,
    pub records: Vec<Record>,
}

/// All series of one metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct NameGroup {
    pub name: String,
    pub series: Vec<SeriesGroup>,
}

/// The contract every storage exposes to metric aggregators.
///
/// `inc` and `set` return the value observed after the mutation. `get` never
/// creates the key and returns 0.0 when it is absent. Encoding failures are
/// the only errors that reach the caller; the shared implementations absorb
/// region exhaustion and lock failures internally, logging them and
/// returning a sentinel, so recording paths never fail.
pub trait Storage: Send + Sync {
    /// Increments the key's value by `delta`, creating it at `delta` if
    /// absent, and returns the new value.
    fn inc(&self, key: &MetricKey, delta: f64) -> Result<f64, StorageError>;

    /// Overwrites the key's value, creating it if absent, and returns the
    /// written value.
    fn set(&self, key: &MetricKey, value: f64) -> Result<f64, StorageError>;

    /// Returns the key's current value, or 0.0 if it is absent.
    fn get(&self, key: &MetricKey) -> Result<f64, StorageError>;

    /// As `inc` for every item, amortizing a single lock acquisition.
    fn inc_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        for (key, delta) in items {
            self.inc(key, *delta)?;
        }
        Ok(())
    }

    /// As `set` for every item, amortizing a single lock acquisition.
    fn set_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        for (key, value) in items {
            self.set(key, *value)?;
        }
        Ok(())
    }

    /// A snapshot of every known series and its value.
    fn iterate(&self) -> Vec<Record>;

    /// Number of known keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key.
    fn clear(&self);

    /// Snapshot of all records, sorted and grouped for exposition: by metric
    /// name, then by grouping labels. Histogram-bucket records group by
    /// their labels without the bucket pair, so all buckets of one series
    /// stay together, ordered by threshold.
    fn items_grouped_by_name(&self) -> Vec<NameGroup> {
        group_by_name(self.iterate())
    }
}

/// Sorts and groups records by `(name, grouping labels)`.
pub(crate) fn group_by_name(mut records: Vec<Record>) -> Vec<NameGroup> {
    records.sort_by(|a, b| a.0.cmp(&b.0));

    let mut groups: Vec<NameGroup> = Vec::new();
    for record in records {
        let name = record.0.name();
        if groups.last().map(|g| g.name.as_str()) != Some(name) {
            groups.push(NameGroup {
                name: name.to_owned(),
                series: Vec::new(),
            });
        }
        let series = &mut groups.last_mut().expect("just pushed").series;
        if series.last().map(|s| s.labels.as_slice()) != Some(record.0.group_labels()) {
            series.push(SeriesGroup {
                labels: record.0.group_labels().to_vec(),
                records: Vec::new(),
            });
        }
        series.last_mut().expect("just pushed").records.push(record);
    }
    groups
}

/// In-process storage: a mutex-guarded map from structured key to value.
#[derive(Default)]
pub struct LocalStorage {
    values: Mutex<HashMap<MetricKey, f64>>,
}

impl LocalStorage {
    pub fn new() -> LocalStorage {
        LocalStorage::default()
    }
}

impl Storage for LocalStorage {
    fn inc(&self, key: &MetricKey, delta: f64) -> Result<f64, StorageError> {
        let mut values = self.values.lock();
        let value = values.entry(key.clone()).or_insert(0.0);
        *value += delta;
        Ok(*value)
    }

    fn set(&self, key: &MetricKey, value: f64) -> Result<f64, StorageError> {
        self.values.lock().insert(key.clone(), value);
        Ok(value)
    }

    fn get(&self, key: &MetricKey) -> Result<f64, StorageError> {
        Ok(self.values.lock().get(key).copied().unwrap_or(0.0))
    }

    fn inc_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        let mut values = self.values.lock();
        for (key, delta) in items {
            *values.entry(key.clone()).or_insert(0.0) += delta;
        }
        Ok(())
    }

    fn set_batch(&self, items: &[Record]) -> Result<(), StorageError> {
        let mut values = self.values.lock();
        for (key, value) in items {
            values.insert(key.clone(), *value);
        }
        Ok(())
    }

    fn iterate(&self) -> Vec<Record> {
        self.values
            .lock()
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect()
    }

    fn len(&self) -> usize {
        self.values.lock().len()
    }

    fn clear(&self) {
        self.values.lock().clear();
    }
}

#[cfg(test)]
pub(crate) use self::tests::sample_records;
