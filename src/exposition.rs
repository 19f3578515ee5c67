//! Prometheus text exposition.
//!
//! Renders a registry's families in the text format version 0.0.4:
//! `# HELP` / `# TYPE` headers followed by sample lines of the form
//! `<name><postfix>{<labels>} <value> <timestamp_ms>`. The `bucket` label
//! is rewritten to `le` here, and infinities render as `+Inf` / `-Inf`;
//! storages know nothing about either.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::key::{LabelValue, MetricKey, BUCKET_LABEL};
use crate::registry::{MetricFamily, Registry};

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn format_value(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_owned()
    } else if value.is_nan() {
        "NaN".to_owned()
    } else {
        format!("{value:?}")
    }
}

fn format_label_value(value: &LabelValue) -> String {
    match value {
        LabelValue::Str(s) => s.clone(),
        LabelValue::Int(i) => i.to_string(),
        LabelValue::Float(f) => format_value(*f),
    }
}

fn format_labels(key: &MetricKey) -> String {
    let mut out = String::new();
    for (i, label) in key.labels().iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let name = if label.name == BUCKET_LABEL {
            "le"
        } else {
            label.name.as_str()
        };
        let _ = write!(out, "{}=\"{}\"", name, format_label_value(&label.value));
    }
    out
}

fn format_sample(key: &MetricKey, value: f64, timestamp: u128, out: &mut String) {
    let _ = writeln!(
        out,
        "{}{}{{{}}} {} {}",
        key.name(),
        key.postfix(),
        format_labels(key),
        format_value(value),
        timestamp,
    );
}

fn format_family(family: &MetricFamily, timestamp: u128, out: &mut String) {
    let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
    let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
    for sample in &family.samples {
        format_sample(&sample.key, sample.value, timestamp, out);
    }
}

/// Collects the registry and renders every family to the text format.
pub fn registry_to_text(registry: &Registry) -> String {
    let timestamp = timestamp_millis();
    let mut out = format!(
        "# prometric {} generated at {}\n",
        env!("CARGO_PKG_VERSION"),
        timestamp,
    );
    for family in registry.collect() {
        format_family(&family, timestamp, &mut out);
    }
    out
}

/// Writes the registry's text exposition to `path` atomically, via a
/// pid-suffixed sibling file and a rename.
pub fn write_to_textfile(registry: &Registry, path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
    fs::write(&tmp, registry_to_text(registry))?;
    fs::rename(&tmp, path)
}
