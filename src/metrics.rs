//! Metric aggregators: counters, gauges, summaries and histograms.
//!
//! Aggregators are thin arithmetic over a storage: each labeled child owns
//! its structured keys and records through the storage facade. Recording
//! never fails into caller code — storage errors are absorbed and logged.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::key::{Label, LabelValue, MetricKey, SampleKind};
use crate::registry::{Collector, MetricFamily, MetricKind, Registry, Sample, Snapshot};
use crate::storage::Storage;
use crate::{MetricError, StorageError};

/// Default histogram bucket thresholds.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005,
    0.01,
    0.025,
    0.05,
    0.075,
    0.1,
    0.25,
    0.5,
    0.75,
    1.0,
    2.5,
    5.0,
    7.5,
    10.0,
    f64::INFINITY,
];

/// Shared declaration state of one metric family.
struct MetricCore {
    name: String,
    help: String,
    label_names: Vec<String>,
    kind: MetricKind,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for MetricCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCore")
            .field("name", &self.name)
            .field("help", &self.help)
            .field("label_names", &self.label_names)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MetricCore {
    fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        kind: MetricKind,
        reserved: &[&str],
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<MetricCore>, MetricError> {
        for name in label_names {
            if reserved.contains(name) {
                return Err(MetricError::ReservedLabel((*name).to_owned()));
            }
        }
        let mut label_names: Vec<String> =
            label_names.iter().map(|name| (*name).to_owned()).collect();
        label_names.sort();
        Ok(Arc::new(MetricCore {
            name: name.to_owned(),
            help: help.to_owned(),
            label_names,
            kind,
            storage,
        }))
    }

    /// Sorts the supplied label pairs and checks them against the declared
    /// label names.
    fn validate_labels(&self, values: &[(&str, LabelValue)]) -> Result<Vec<Label>, MetricError> {
        let mut labels: Vec<Label> = values
            .iter()
            .map(|(name, value)| Label::new(*name, value.clone()))
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        let got: Vec<String> = labels.iter().map(|label| label.name.clone()).collect();
        if got != self.label_names {
            return Err(MetricError::InvalidLabels {
                expected: self.label_names.clone(),
                got,
            });
        }
        Ok(labels)
    }

    fn uid(&self) -> String {
        format!("{}-{:?}", self.name, self.label_names)
    }

    fn absorb(&self, result: Result<f64, StorageError>) -> f64 {
        match result {
            Ok(value) => value,
            Err(err) => {
                log::error!("metric {}: {err}", self.name);
                0.0
            }
        }
    }

    /// Builds this family from the collection snapshot: every record
    /// grouped under the family's name, in exposition order.
    fn family_from_snapshot(&self, snapshot: &Snapshot) -> MetricFamily {
        let samples = snapshot
            .iter()
            .find(|group| group.name == self.name)
            .map(|group| {
                group
                    .series
                    .iter()
                    .flat_map(|series| series.records.iter())
                    .map(|(key, value)| Sample {
                        key: key.clone(),
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default();
        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: self.kind,
            samples,
        }
    }
}

macro_rules! metric_collector {
    ($metric:ty) => {
        impl Collector for $metric {
            fn uid(&self) -> String {
                self.core.uid()
            }

            fn collect(&self, snapshot: &Snapshot) -> Vec<MetricFamily> {
                vec![self.core.family_from_snapshot(snapshot)]
            }
        }
    };
}

macro_rules! unlabeled_proxy {
    ($metric:ty, $child:ident) => {
        impl $metric {
            fn unlabeled(&self) -> Option<$child> {
                if self.core.label_names.is_empty() {
                    self.labels(&[]).ok()
                } else {
                    log::error!("metric {} requires labels", self.core.name);
                    None
                }
            }
        }
    };
}

/// A monotonically increasing value.
#[derive(Clone)]
pub struct Counter {
    core: Arc<MetricCore>,
}

impl Counter {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        storage: Arc<dyn Storage>,
    ) -> Result<Counter, MetricError> {
        Ok(Counter {
            core: MetricCore::new(name, help, label_names, MetricKind::Counter, &[], storage)?,
        })
    }

    /// Declares the counter against the registry's storage and registers
    /// it.
    pub fn with_registry(
        name: &str,
        help: &str,
        label_names: &[&str],
        registry: &Registry,
    ) -> Result<Counter, MetricError> {
        let counter = Counter::new(name, help, label_names, registry.storage().clone())?;
        registry.register(Arc::new(counter.clone()))?;
        Ok(counter)
    }

    /// Binds a child for the given label values.
    pub fn labels(&self, values: &[(&str, LabelValue)]) -> Result<CounterChild, MetricError> {
        let labels = self.core.validate_labels(values)?;
        Ok(CounterChild {
            key: MetricKey::new(SampleKind::Counter, self.core.name.clone(), "", labels),
            core: self.core.clone(),
        })
    }

    pub fn inc(&self, amount: f64) {
        if let Some(child) = self.unlabeled() {
            child.inc(amount);
        }
    }

    pub fn get(&self) -> f64 {
        self.unlabeled().map(|child| child.get()).unwrap_or(0.0)
    }
}

metric_collector!(Counter);
unlabeled_proxy!(Counter, CounterChild);

/// A counter bound to one label set.
#[derive(Clone, Debug)]
pub struct CounterChild {
    core: Arc<MetricCore>,
    key: MetricKey,
}

impl CounterChild {
    pub fn inc(&self, amount: f64) {
        self.core.absorb(self.core.storage.inc(&self.key, amount));
    }

    pub fn get(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.key))
    }

    pub fn key(&self) -> &MetricKey {
        &self.key
    }
}

/// A value that can go up and down.
#[derive(Clone)]
pub struct Gauge {
    core: Arc<MetricCore>,
}

impl Gauge {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        storage: Arc<dyn Storage>,
    ) -> Result<Gauge, MetricError> {
        Ok(Gauge {
            core: MetricCore::new(name, help, label_names, MetricKind::Gauge, &[], storage)?,
        })
    }

    pub fn with_registry(
        name: &str,
        help: &str,
        label_names: &[&str],
        registry: &Registry,
    ) -> Result<Gauge, MetricError> {
        let gauge = Gauge::new(name, help, label_names, registry.storage().clone())?;
        registry.register(Arc::new(gauge.clone()))?;
        Ok(gauge)
    }

    pub fn labels(&self, values: &[(&str, LabelValue)]) -> Result<GaugeChild, MetricError> {
        let labels = self.core.validate_labels(values)?;
        Ok(GaugeChild {
            key: MetricKey::new(SampleKind::Gauge, self.core.name.clone(), "", labels),
            core: self.core.clone(),
        })
    }

    pub fn inc(&self, amount: f64) {
        if let Some(child) = self.unlabeled() {
            child.inc(amount);
        }
    }

    pub fn dec(&self, amount: f64) {
        if let Some(child) = self.unlabeled() {
            child.dec(amount);
        }
    }

    pub fn set(&self, value: f64) {
        if let Some(child) = self.unlabeled() {
            child.set(value);
        }
    }

    pub fn get(&self) -> f64 {
        self.unlabeled().map(|child| child.get()).unwrap_or(0.0)
    }
}

metric_collector!(Gauge);
unlabeled_proxy!(Gauge, GaugeChild);

/// A gauge bound to one label set.
#[derive(Clone)]
pub struct GaugeChild {
    core: Arc<MetricCore>,
    key: MetricKey,
}

impl GaugeChild {
    pub fn inc(&self, amount: f64) {
        self.core.absorb(self.core.storage.inc(&self.key, amount));
    }

    pub fn dec(&self, amount: f64) {
        self.inc(-amount);
    }

    pub fn set(&self, value: f64) {
        self.core.absorb(self.core.storage.set(&self.key, value));
    }

    pub fn get(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.key))
    }

    /// Sets the gauge to the current unix time in seconds.
    pub fn set_to_current_time(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.set(now.as_secs_f64());
    }

    /// Increments the gauge now and decrements it when the guard drops.
    pub fn track_in_progress(&self) -> InProgressGuard {
        self.inc(1.0);
        InProgressGuard {
            child: self.clone(),
        }
    }

    /// Sets the gauge to the guard's lifetime in seconds when it drops.
    pub fn start_timer(&self) -> GaugeTimer {
        GaugeTimer {
            child: self.clone(),
            start: Instant::now(),
        }
    }

    pub fn key(&self) -> &MetricKey {
        &self.key
    }
}

/// Decrements its gauge when dropped, on every exit path.
pub struct InProgressGuard {
    child: GaugeChild,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.child.dec(1.0);
    }
}

/// Writes its elapsed seconds into the gauge when dropped.
pub struct GaugeTimer {
    child: GaugeChild,
    start: Instant,
}

impl Drop for GaugeTimer {
    fn drop(&mut self) {
        self.child.set(self.start.elapsed().as_secs_f64());
    }
}

/// An event summary: total sum and count of observations.
///
/// Quantile series are declared but not estimated; the quantile slots stay
/// placeholders until an estimator exists.
#[derive(Clone, Debug)]
pub struct Summary {
    core: Arc<MetricCore>,
    quantiles: Vec<f64>,
}

impl Summary {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        quantiles: &[f64],
        storage: Arc<dyn Storage>,
    ) -> Result<Summary, MetricError> {
        let mut quantiles = quantiles.to_vec();
        quantiles.sort_by(f64::total_cmp);
        Ok(Summary {
            core: MetricCore::new(
                name,
                help,
                label_names,
                MetricKind::Summary,
                &["quantile"],
                storage,
            )?,
            quantiles,
        })
    }

    pub fn with_registry(
        name: &str,
        help: &str,
        label_names: &[&str],
        registry: &Registry,
    ) -> Result<Summary, MetricError> {
        let summary = Summary::new(name, help, label_names, &[], registry.storage().clone())?;
        registry.register(Arc::new(summary.clone()))?;
        Ok(summary)
    }

    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    pub fn labels(&self, values: &[(&str, LabelValue)]) -> Result<SummaryChild, MetricError> {
        let labels = self.core.validate_labels(values)?;
        Ok(SummaryChild {
            sum_key: MetricKey::new(
                SampleKind::SummarySum,
                self.core.name.clone(),
                "_sum",
                labels.clone(),
            ),
            count_key: MetricKey::new(
                SampleKind::SummaryCount,
                self.core.name.clone(),
                "_count",
                labels,
            ),
            core: self.core.clone(),
        })
    }

    pub fn observe(&self, value: f64) {
        if let Some(child) = self.unlabeled() {
            child.observe(value);
        }
    }
}

metric_collector!(Summary);
unlabeled_proxy!(Summary, SummaryChild);

/// A summary bound to one label set.
#[derive(Clone)]
pub struct SummaryChild {
    core: Arc<MetricCore>,
    sum_key: MetricKey,
    count_key: MetricKey,
}

impl SummaryChild {
    pub fn observe(&self, value: f64) {
        self.core.absorb(self.core.storage.inc(&self.sum_key, value));
        self.core.absorb(self.core.storage.inc(&self.count_key, 1.0));
    }

    pub fn sum(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.sum_key))
    }

    pub fn count(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.count_key))
    }

    /// Observes the guard's lifetime in seconds when it drops.
    pub fn start_timer(&self) -> SummaryTimer {
        SummaryTimer {
            child: self.clone(),
            start: Instant::now(),
        }
    }
}

/// Observes its elapsed seconds into the summary when dropped.
pub struct SummaryTimer {
    child: SummaryChild,
    start: Instant,
}

impl Drop for SummaryTimer {
    fn drop(&mut self) {
        self.child.observe(self.start.elapsed().as_secs_f64());
    }
}

/// A bucketed event distribution.
#[derive(Clone)]
pub struct Histogram {
    core: Arc<MetricCore>,
    buckets: Vec<f64>,
}

impl Histogram {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
        storage: Arc<dyn Storage>,
    ) -> Result<Histogram, MetricError> {
        let mut buckets = buckets.to_vec();
        buckets.sort_by(f64::total_cmp);
        Ok(Histogram {
            core: MetricCore::new(
                name,
                help,
                label_names,
                MetricKind::Histogram,
                &["le", "bucket"],
                storage,
            )?,
            buckets,
        })
    }

    pub fn with_registry(
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
        registry: &Registry,
    ) -> Result<Histogram, MetricError> {
        let histogram =
            Histogram::new(name, help, label_names, buckets, registry.storage().clone())?;
        registry.register(Arc::new(histogram.clone()))?;
        Ok(histogram)
    }

    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    pub fn labels(&self, values: &[(&str, LabelValue)]) -> Result<HistogramChild, MetricError> {
        let labels = self.core.validate_labels(values)?;
        let buckets = self
            .buckets
            .iter()
            .map(|threshold| {
                (
                    *threshold,
                    MetricKey::bucket(self.core.name.clone(), *threshold, labels.clone()),
                )
            })
            .collect();
        Ok(HistogramChild {
            sum_key: MetricKey::new(
                SampleKind::HistogramSum,
                self.core.name.clone(),
                "_sum",
                labels.clone(),
            ),
            count_key: MetricKey::new(
                SampleKind::HistogramCount,
                self.core.name.clone(),
                "_count",
                labels,
            ),
            buckets,
            core: self.core.clone(),
        })
    }

    pub fn observe(&self, value: f64) {
        if let Some(child) = self.unlabeled() {
            child.observe(value);
        }
    }
}

metric_collector!(Histogram);
unlabeled_proxy!(Histogram, HistogramChild);

/// A histogram bound to one label set.
#[derive(Clone)]
pub struct HistogramChild {
    core: Arc<MetricCore>,
    sum_key: MetricKey,
    count_key: MetricKey,
    buckets: Vec<(f64, MetricKey)>,
}

impl HistogramChild {
    /// Records one observation: the sum grows by `value`, the count by one,
    /// and every bucket whose threshold exceeds `value` by one. Buckets the
    /// observation misses are still incremented by zero so the series
    /// exists from the first observation on.
    pub fn observe(&self, value: f64) {
        self.core.absorb(self.core.storage.inc(&self.sum_key, value));
        self.core.absorb(self.core.storage.inc(&self.count_key, 1.0));
        for (threshold, key) in &self.buckets {
            let hit = if value < *threshold { 1.0 } else { 0.0 };
            self.core.absorb(self.core.storage.inc(key, hit));
        }
    }

    pub fn sum(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.sum_key))
    }

    pub fn count(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.count_key))
    }

    pub fn bucket_value(&self, threshold: f64) -> f64 {
        self.buckets
            .iter()
            .find(|(t, _)| *t == threshold)
            .map(|(_, key)| self.core.absorb(self.core.storage.get(key)))
            .unwrap_or(0.0)
    }

    /// Observes the guard's lifetime in seconds when it drops.
    pub fn start_timer(&self) -> HistogramTimer {
        HistogramTimer {
            child: self.clone(),
            start: Instant::now(),
        }
    }
}

/// Observes its elapsed seconds into the histogram when dropped.
pub struct HistogramTimer {
    child: HistogramChild,
    start: Instant,
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.child.observe(self.start.elapsed().as_secs_f64());
    }
}

/// An untyped metric family; exported with `# TYPE ... untyped`.
#[derive(Clone)]
pub struct Untyped {
    core: Arc<MetricCore>,
}

impl Untyped {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        storage: Arc<dyn Storage>,
    ) -> Result<Untyped, MetricError> {
        Ok(Untyped {
            core: MetricCore::new(name, help, label_names, MetricKind::Untyped, &[], storage)?,
        })
    }

    pub fn with_registry(
        name: &str,
        help: &str,
        label_names: &[&str],
        registry: &Registry,
    ) -> Result<Untyped, MetricError> {
        let untyped = Untyped::new(name, help, label_names, registry.storage().clone())?;
        registry.register(Arc::new(untyped.clone()))?;
        Ok(untyped)
    }

    pub fn labels(&self, values: &[(&str, LabelValue)]) -> Result<UntypedChild, MetricError> {
        let labels = self.core.validate_labels(values)?;
        Ok(UntypedChild {
            key: MetricKey::new(SampleKind::Base, self.core.name.clone(), "", labels),
            core: self.core.clone(),
        })
    }
}

metric_collector!(Untyped);

/// An untyped metric bound to one label set.
#[derive(Clone)]
pub struct UntypedChild {
    core: Arc<MetricCore>,
    key: MetricKey,
}

impl UntypedChild {
    pub fn inc(&self, amount: f64) {
        self.core.absorb(self.core.storage.inc(&self.key, amount));
    }

    pub fn get(&self) -> f64 {
        self.core.absorb(self.core.storage.get(&self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn storage() -> Arc<dyn Storage> {
        Arc::new(LocalStorage::new())
    }

    fn labelset() -> Vec<(&'static str, LabelValue)> {
        vec![
            ("label1", "label1_value".into()),
            ("label2", "label2_value".into()),
        ]
    }

    #[test]
    fn counter_accumulates() {
        let counter = Counter::new(
            "counter_metric_name",
            "counter_metric_name doc",
            &["label1", "label2"],
            storage(),
        )
        .unwrap();
        let child = counter.labels(&labelset()).unwrap();

        assert_eq!(child.get(), 0.0);
        child.inc(10.0);
        assert_eq!(child.get(), 10.0);

        assert_eq!(
            child.key(),
            &MetricKey::new(
                SampleKind::Counter,
                "counter_metric_name",
                "",
                vec![
                    Label::new("label1", "label1_value"),
                    Label::new("label2", "label2_value"),
                ],
            )
        );
    }

    #[test]
    fn label_arity_is_validated() {
        let counter = Counter::new("c", "doc", &["label1", "label2"], storage()).unwrap();
        let err = counter.labels(&[("label1", "x".into())]).unwrap_err();
        assert_eq!(
            err,
            MetricError::InvalidLabels {
                expected: vec!["label1".to_owned(), "label2".to_owned()],
                got: vec!["label1".to_owned()],
            }
        );
        assert!(counter
            .labels(&[("label1", "x".into()), ("other", "y".into())])
            .is_err());
    }

    #[test]
    fn reserved_labels_are_rejected() {
        assert_eq!(
            Summary::new("s", "doc", &["quantile"], &[], storage()).unwrap_err(),
            MetricError::ReservedLabel("quantile".to_owned())
        );
        assert!(Histogram::new("h", "doc", &["le"], DEFAULT_BUCKETS, storage()).is_err());
        assert!(Histogram::new("h", "doc", &["bucket"], DEFAULT_BUCKETS, storage()).is_err());
    }

    #[test]
    fn gauge_moves_both_ways() {
        let gauge = Gauge::new("g", "doc", &[], storage()).unwrap();
        gauge.inc(10.0);
        assert_eq!(gauge.get(), 10.0);
        gauge.dec(4.0);
        assert_eq!(gauge.get(), 6.0);
        gauge.set(-1.5);
        assert_eq!(gauge.get(), -1.5);
    }

    #[test]
    fn gauge_tracks_in_progress() {
        let gauge = Gauge::new("g", "doc", &["label1"], storage()).unwrap();
        let child = gauge.labels(&[("label1", "inprogress".into())]).unwrap();
        {
            let _guard = child.track_in_progress();
            assert_eq!(child.get(), 1.0);
        }
        assert_eq!(child.get(), 0.0);
    }

    #[test]
    fn gauge_set_to_current_time_is_recent() {
        let gauge = Gauge::new("g", "doc", &[], storage()).unwrap();
        let child = gauge.labels(&[]).unwrap();
        child.set_to_current_time();
        assert!(child.get() > 1.5e9);
    }

    #[test]
    fn summary_observes_sum_and_count() {
        let summary = Summary::new(
            "summary_metric_name",
            "doc",
            &["label1", "label2"],
            &[],
            storage(),
        )
        .unwrap();
        let child = summary.labels(&labelset()).unwrap();

        child.observe(10.0);
        assert_eq!(child.sum(), 10.0);
        assert_eq!(child.count(), 1.0);

        child.observe(14.0);
        assert_eq!(child.sum(), 24.0);
        assert_eq!(child.count(), 2.0);

        assert!(summary.quantiles().is_empty());
    }

    #[test]
    fn histogram_buckets_observations() {
        let histogram = Histogram::new(
            "h",
            "doc",
            &[],
            &[0.005, 0.01, 7.5, f64::INFINITY],
            storage(),
        )
        .unwrap();
        let child = histogram.labels(&[]).unwrap();

        child.observe(6.0);
        assert_eq!(child.sum(), 6.0);
        assert_eq!(child.count(), 1.0);
        assert_eq!(child.bucket_value(0.005), 0.0);
        assert_eq!(child.bucket_value(0.01), 0.0);
        assert_eq!(child.bucket_value(7.5), 1.0);
        assert_eq!(child.bucket_value(f64::INFINITY), 1.0);

        // Every bucket series exists after the first observation.
        assert_eq!(histogram.core.storage.len(), 6);
    }

    #[test]
    fn collector_only_sees_its_own_family() {
        let storage = storage();
        let counter =
            Counter::new("counter_a", "doc a", &[], storage.clone()).unwrap();
        let other = Counter::new("counter_b", "doc b", &[], storage.clone()).unwrap();
        counter.labels(&[]).unwrap().inc(1.0);
        other.labels(&[]).unwrap().inc(2.0);

        let snapshot = storage.items_grouped_by_name();
        let families = Collector::collect(&counter, &snapshot);
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "counter_a");
        assert_eq!(families[0].samples.len(), 1);
        assert_eq!(families[0].samples[0].value, 1.0);
    }

    #[test]
    fn timer_guards_record_elapsed_time() {
        let gauge = Gauge::new("g", "doc", &[], storage()).unwrap();
        let child = gauge.labels(&[]).unwrap();
        {
            let _timer = child.start_timer();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(child.get() > 0.0);

        let summary = Summary::new("s", "doc", &[], &[], storage()).unwrap();
        let child = summary.labels(&[]).unwrap();
        {
            let _timer = child.start_timer();
        }
        assert_eq!(child.count(), 1.0);
    }
}
