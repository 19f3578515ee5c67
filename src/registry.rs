//! The collector registry.
//!
//! A [`Registry`] links metric aggregators with the storage that holds
//! their samples. Collection takes one grouped snapshot of the storage and
//! hands it to every registered collector; collectors that compute their
//! samples on the fly (the process collector, storage stats) simply ignore
//! the snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::MetricKey;
use crate::storage::{NameGroup, Storage};
use crate::MetricError;

/// One exported sample: a structured key and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub key: MetricKey,
    pub value: f64,
}

/// The exposition type of a metric family, as rendered on `# TYPE` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Untyped,
    Gauge,
    Counter,
    Summary,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Untyped => "untyped",
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Summary => "summary",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// A named family of samples with its help text and exposition type.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

/// One storage snapshot, grouped by metric name, shared by all collectors
/// of a collection pass.
pub type Snapshot = Vec<NameGroup>;

/// Anything that can contribute metric families to a collection pass.
pub trait Collector: Send + Sync {
    /// Stable identifier; registering two collectors with the same uid is
    /// an error.
    fn uid(&self) -> String;

    /// Produces the collector's families, reading series from the snapshot
    /// or computing them directly.
    fn collect(&self, snapshot: &Snapshot) -> Vec<MetricFamily>;
}

/// Links collectors with a storage and drives collection.
pub struct Registry {
    storage: Arc<dyn Storage>,
    collectors: Mutex<BTreeMap<String, Arc<dyn Collector>>>,
}

impl Registry {
    pub fn new(storage: Arc<dyn Storage>) -> Registry {
        Registry {
            storage,
            collectors: Mutex::new(BTreeMap::new()),
        }
    }

    /// The storage metrics registered here record into.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Adds a collector to the registry.
    pub fn register(&self, collector: Arc<dyn Collector>) -> Result<(), MetricError> {
        let uid = collector.uid();
        let mut collectors = self.collectors.lock();
        if collectors.contains_key(&uid) {
            return Err(MetricError::AlreadyRegistered(uid));
        }
        collectors.insert(uid, collector);
        Ok(())
    }

    /// Removes a collector; unknown uids are ignored.
    pub fn unregister(&self, uid: &str) {
        self.collectors.lock().remove(uid);
    }

    pub fn is_registered(&self, uid: &str) -> bool {
        self.collectors.lock().contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.collectors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.lock().is_empty()
    }

    /// Gathers the families of every registered collector against one
    /// storage snapshot.
    pub fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.storage.items_grouped_by_name();
        let collectors: Vec<Arc<dyn Collector>> =
            self.collectors.lock().values().cloned().collect();
        collectors
            .iter()
            .flat_map(|collector| collector.collect(&snapshot))
            .collect()
    }
}
