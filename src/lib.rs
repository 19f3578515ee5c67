#![doc(html_root_url = "https://docs.rs/prometric/0.1.0")]

//! A Prometheus instrumentation library with shared-memory multi-process
//! counter storage.
//!
//! Application code declares metric families ([`Counter`], [`Gauge`],
//! [`Summary`], [`Histogram`]), records observations under label sets, and
//! exports the current snapshot in the Prometheus text format via
//! [`registry_to_text`].
//!
//! Samples live in a [`Storage`]. Single-process applications can use the
//! in-process [`LocalStorage`]; pre-forking servers attach a
//! [`SharedStorage`] to a [`Region`] — a fixed byte buffer shared by every
//! worker, typically an [`MmapRegion`] over a file — so that one scrape
//! observes the aggregate of all workers. [`FlushStorage`] buffers
//! increments locally and merges them into the shared table in batches to
//! amortize region locking.
//!
//! ```
//! use std::sync::Arc;
//!
//! use prometric::{Counter, LocalStorage, Registry, registry_to_text};
//!
//! let registry = Registry::new(Arc::new(LocalStorage::new()));
//! let requests = Counter::with_registry(
//!     "app:requests_total",
//!     "Total processed requests",
//!     &["env_name"],
//!     &registry,
//! ).unwrap();
//!
//! requests.labels(&[("env_name", "test".into())]).unwrap().inc(1.0);
//! let text = registry_to_text(&registry);
//! assert!(text.contains("app:requests_total{env_name=\"test\"} 1.0"));
//! ```

mod error;
mod flush;
mod key;
mod metrics;
#[cfg(target_os = "linux")]
mod process;
mod region;
mod registry;
mod shared;
mod storage;

pub mod encoding;
pub mod exposition;

pub use crate::error::{DecodeError, EncodeError, MetricError, StorageError};
pub use crate::exposition::{registry_to_text, write_to_textfile, TEXT_CONTENT_TYPE};
pub use crate::flush::FlushStorage;
pub use crate::key::{Label, LabelValue, MetricKey, SampleKind, BUCKET_LABEL};
pub use crate::metrics::{
    Counter, CounterChild, Gauge, GaugeChild, GaugeTimer, Histogram, HistogramChild,
    HistogramTimer, InProgressGuard, Summary, SummaryChild, SummaryTimer, Untyped, UntypedChild,
    DEFAULT_BUCKETS,
};
#[cfg(target_os = "linux")]
pub use crate::process::ProcessCollector;
pub use crate::region::{
    region_id_from_env, HeapRegion, MmapRegion, Region, DEFAULT_REGION_CAPACITY, REGION_ID_ENV,
};
pub use crate::registry::{Collector, MetricFamily, MetricKind, Registry, Sample, Snapshot};
pub use crate::shared::{SharedStorage, SharedStorageStats};
pub use crate::storage::{LocalStorage, NameGroup, Record, SeriesGroup, Storage};
