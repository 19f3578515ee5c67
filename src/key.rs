//! Structured metric keys.
//!
//! A [`MetricKey`] identifies one time series in a storage: the sample kind,
//! the metric name, an optional name postfix (`_sum`, `_count`, `_bucket`,
//! `_quantile`) and the sorted label pairs. Keys are compared, hashed and
//! serialized through their canonical form, so two structurally equal keys
//! are interchangeable across processes and restarts.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::DecodeError;

/// The kind of a stored sample.
///
/// The integer value is the type tag carried in the canonical key encoding.
/// Storages do not interpret kinds except for the histogram-bucket grouping
/// rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SampleKind {
    Base = 1,
    Gauge = 2,
    Counter = 3,
    Summary = 4,
    SummarySum = 5,
    SummaryCount = 7,
    SummaryQuantile = 8,
    Histogram = 10,
    HistogramSum = 11,
    HistogramCount = 12,
    HistogramBucket = 13,
}

impl TryFrom<u8> for SampleKind {
    type Error = DecodeError;

    #[inline]
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SampleKind::Base),
            2 => Ok(SampleKind::Gauge),
            3 => Ok(SampleKind::Counter),
            4 => Ok(SampleKind::Summary),
            5 => Ok(SampleKind::SummarySum),
            7 => Ok(SampleKind::SummaryCount),
            8 => Ok(SampleKind::SummaryQuantile),
            10 => Ok(SampleKind::Histogram),
            11 => Ok(SampleKind::HistogramSum),
            12 => Ok(SampleKind::HistogramCount),
            13 => Ok(SampleKind::HistogramBucket),
            _ => Err(DecodeError::new(format!("invalid sample kind: {value}"))),
        }
    }
}

/// A label value scalar.
///
/// Floats compare and hash by bit pattern so that keys can be map keys; the
/// total order uses `f64::total_cmp`. `Float` carries bucket thresholds,
/// including `+Inf`.
#[derive(Clone, Debug)]
pub enum LabelValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl LabelValue {
    #[inline]
    fn rank(&self) -> u8 {
        match self {
            LabelValue::Str(_) => 0,
            LabelValue::Int(_) => 1,
            LabelValue::Float(_) => 2,
        }
    }
}

impl PartialEq for LabelValue {
    fn eq(&self, other: &LabelValue) -> bool {
        match (self, other) {
            (LabelValue::Str(a), LabelValue::Str(b)) => a == b,
            (LabelValue::Int(a), LabelValue::Int(b)) => a == b,
            (LabelValue::Float(a), LabelValue::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for LabelValue {}

impl Hash for LabelValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            LabelValue::Str(s) => s.hash(state),
            LabelValue::Int(i) => i.hash(state),
            LabelValue::Float(f) => f.to_bits().hash(state),
        }
    }
}

impl Ord for LabelValue {
    fn cmp(&self, other: &LabelValue) -> Ordering {
        match (self, other) {
            (LabelValue::Str(a), LabelValue::Str(b)) => a.cmp(b),
            (LabelValue::Int(a), LabelValue::Int(b)) => a.cmp(b),
            (LabelValue::Float(a), LabelValue::Float(b)) => a.total_cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for LabelValue {
    fn partial_cmp(&self, other: &LabelValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelValue::Str(s) => f.write_str(s),
            LabelValue::Int(i) => write!(f, "{i}"),
            LabelValue::Float(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<&str> for LabelValue {
    fn from(value: &str) -> LabelValue {
        LabelValue::Str(value.to_owned())
    }
}

impl From<String> for LabelValue {
    fn from(value: String) -> LabelValue {
        LabelValue::Str(value)
    }
}

impl From<i64> for LabelValue {
    fn from(value: i64) -> LabelValue {
        LabelValue::Int(value)
    }
}

impl From<f64> for LabelValue {
    fn from(value: f64) -> LabelValue {
        LabelValue::Float(value)
    }
}

/// A single label pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: LabelValue,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<LabelValue>) -> Label {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The label name carried by histogram bucket series. Rewritten to `le` at
/// the text exposition boundary.
pub const BUCKET_LABEL: &str = "bucket";

/// A structured key identifying one stored time series.
///
/// Labels are kept sorted by label name. For histogram-bucket keys the first
/// label is always `("bucket", threshold)`; it stays in the serialized key
/// but is skipped when series are grouped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    kind: SampleKind,
    name: String,
    postfix: String,
    labels: Vec<Label>,
}

impl MetricKey {
    /// Creates a key, sorting the labels by name.
    pub fn new(
        kind: SampleKind,
        name: impl Into<String>,
        postfix: impl Into<String>,
        mut labels: Vec<Label>,
    ) -> MetricKey {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        MetricKey {
            kind,
            name: name.into(),
            postfix: postfix.into(),
            labels,
        }
    }

    /// Creates a histogram-bucket key: the grouping labels are sorted and
    /// the `("bucket", threshold)` pair is placed first.
    pub fn bucket(name: impl Into<String>, threshold: f64, mut labels: Vec<Label>) -> MetricKey {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.insert(0, Label::new(BUCKET_LABEL, threshold));
        MetricKey {
            kind: SampleKind::HistogramBucket,
            name: name.into(),
            postfix: "_bucket".to_owned(),
            labels,
        }
    }

    pub(crate) fn from_parts(
        kind: SampleKind,
        name: String,
        postfix: String,
        labels: Vec<Label>,
    ) -> MetricKey {
        MetricKey {
            kind,
            name,
            postfix,
            labels,
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn postfix(&self) -> &str {
        &self.postfix
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// The labels that identify the series for grouping: all of them, except
    /// that histogram-bucket keys skip the leading bucket pair.
    pub fn group_labels(&self) -> &[Label] {
        if self.kind == SampleKind::HistogramBucket && !self.labels.is_empty() {
            &self.labels[1..]
        } else {
            &self.labels
        }
    }

    /// The bucket threshold of a histogram-bucket key.
    pub fn bucket_threshold(&self) -> Option<&LabelValue> {
        if self.kind == SampleKind::HistogramBucket {
            self.labels.first().map(|label| &label.value)
        } else {
            None
        }
    }
}

impl Ord for MetricKey {
    /// Orders keys by `(name, group labels, kind, threshold)` so that all
    /// buckets of one histogram series sort together, threshold-ascending.
    fn cmp(&self, other: &MetricKey) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.group_labels().cmp(other.group_labels()))
            .then_with(|| (self.kind as u8).cmp(&(other.kind as u8)))
            .then_with(|| self.bucket_threshold().cmp(&other.bucket_threshold()))
            .then_with(|| self.postfix.cmp(&other.postfix))
    }
}

impl PartialOrd for MetricKey {
    fn partial_cmp(&self, other: &MetricKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sorted() {
        let key = MetricKey::new(
            SampleKind::Gauge,
            "g",
            "",
            vec![Label::new("zz", "1"), Label::new("aa", "2")],
        );
        assert_eq!(key.labels()[0].name, "aa");
        assert_eq!(key.labels()[1].name, "zz");
    }

    #[test]
    fn bucket_label_stays_first() {
        let key = MetricKey::bucket("h", 0.5, vec![Label::new("aa", "x")]);
        assert_eq!(key.labels()[0].name, BUCKET_LABEL);
        assert_eq!(key.labels()[0].value, LabelValue::Float(0.5));
        assert_eq!(key.group_labels().len(), 1);
        assert_eq!(key.group_labels()[0].name, "aa");
        assert_eq!(key.bucket_threshold(), Some(&LabelValue::Float(0.5)));
    }

    #[test]
    fn buckets_order_by_threshold() {
        let labels = || vec![Label::new("l", "v")];
        let mut keys = vec![
            MetricKey::bucket("h", f64::INFINITY, labels()),
            MetricKey::bucket("h", 0.5, labels()),
            MetricKey::bucket("h", 7.5, labels()),
        ];
        keys.sort();
        let thresholds: Vec<_> = keys
            .iter()
            .map(|k| k.bucket_threshold().cloned().unwrap())
            .collect();
        assert_eq!(
            thresholds,
            vec![
                LabelValue::Float(0.5),
                LabelValue::Float(7.5),
                LabelValue::Float(f64::INFINITY),
            ]
        );
    }

    #[test]
    fn float_values_are_map_safe() {
        assert_eq!(LabelValue::Float(0.25), LabelValue::Float(0.25));
        assert_ne!(LabelValue::Float(0.25), LabelValue::Float(0.5));
        assert_eq!(
            LabelValue::Float(f64::INFINITY),
            LabelValue::Float(f64::INFINITY)
        );
    }

    #[test]
    fn sample_kind_roundtrip() {
        for tag in [1u8, 2, 3, 4, 5, 7, 8, 10, 11, 12, 13] {
            let kind = SampleKind::try_from(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert!(SampleKind::try_from(6).is_err());
        assert!(SampleKind::try_from(0).is_err());
    }
}
