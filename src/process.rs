//! Host-process statistics collector (Linux).
//!
//! Exports gauges about the calling process from `/proc/self`: memory by
//! type, cumulative CPU seconds, start time, thread count and open file
//! descriptors. Metric names are prefixed with the collector's namespace.

use std::fs;
use std::io;

use crate::key::{Label, MetricKey, SampleKind};
use crate::registry::{Collector, MetricFamily, MetricKind, Sample, Snapshot};

/// Fields of `/proc/self/stat` this collector reads.
struct ProcStat {
    utime: u64,
    stime: u64,
    num_threads: f64,
    starttime: u64,
    vsize: f64,
    rss_pages: f64,
}

fn stat_field(fields: &[&str], index: usize) -> io::Result<u64> {
    fields
        .get(index)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad /proc/self/stat field"))
}

fn read_proc_stat() -> io::Result<ProcStat> {
    let stat = fs::read_to_string("/proc/self/stat")?;
    // The comm field may contain spaces; fields count from after its
    // closing parenthesis (state is field 3).
    let rest = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/self/stat"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    Ok(ProcStat {
        utime: stat_field(&fields, 11)?,
        stime: stat_field(&fields, 12)?,
        num_threads: stat_field(&fields, 17)? as f64,
        starttime: stat_field(&fields, 19)?,
        vsize: stat_field(&fields, 20)? as f64,
        rss_pages: stat_field(&fields, 21)? as f64,
    })
}

fn clock_ticks_per_second() -> f64 {
    // Safety: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

fn page_size_bytes() -> f64 {
    // Safety: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as f64
    } else {
        4096.0
    }
}

/// Seconds since the epoch at which the host booted, from `/proc/stat`.
fn boot_time_seconds() -> io::Result<f64> {
    let stat = fs::read_to_string("/proc/stat")?;
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no btime in /proc/stat"))
}

fn open_fds() -> io::Result<f64> {
    Ok(fs::read_dir("/proc/self/fd")?.count() as f64)
}

/// Collector exporting gauges about the calling process.
pub struct ProcessCollector {
    namespace: String,
    labels: Vec<Label>,
}

impl ProcessCollector {
    pub fn new(namespace: impl Into<String>, labels: Vec<Label>) -> ProcessCollector {
        ProcessCollector {
            namespace: namespace.into(),
            labels,
        }
    }

    /// Prefixes a metric name with the collector namespace.
    pub fn metric_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_owned()
        } else {
            format!("{}:{}", self.namespace, name)
        }
    }

    fn family(
        &self,
        name: &str,
        help: &str,
        kind: MetricKind,
        values: Vec<(Vec<Label>, f64)>,
    ) -> MetricFamily {
        let name = self.metric_name(name);
        let samples = values
            .into_iter()
            .map(|(extra, value)| {
                let mut labels = self.labels.clone();
                labels.extend(extra);
                Sample {
                    key: MetricKey::new(SampleKind::Gauge, name.clone(), "", labels),
                    value,
                }
            })
            .collect();
        MetricFamily {
            help: help.to_owned(),
            kind,
            samples,
            name,
        }
    }
}

impl Collector for ProcessCollector {
    fn uid(&self) -> String {
        format!("process-collector:{}", self.namespace)
    }

    fn collect(&self, _snapshot: &Snapshot) -> Vec<MetricFamily> {
        let stat = match read_proc_stat() {
            Ok(stat) => stat,
            Err(err) => {
                log::warn!("failed to read process stats: {err}");
                return Vec::new();
            }
        };
        let ticks = clock_ticks_per_second();

        let mut families = vec![
            self.family(
                "memory_bytes",
                "Process memory usage in bytes",
                MetricKind::Gauge,
                vec![
                    (
                        vec![Label::new("type", "rss")],
                        stat.rss_pages * page_size_bytes(),
                    ),
                    (vec![Label::new("type", "vsz")], stat.vsize),
                ],
            ),
            self.family(
                "cpu_seconds_total",
                "Cumulative process CPU seconds",
                MetricKind::Counter,
                vec![(Vec::new(), (stat.utime + stat.stime) as f64 / ticks)],
            ),
            self.family(
                "threads_total",
                "Number of process threads",
                MetricKind::Gauge,
                vec![(Vec::new(), stat.num_threads)],
            ),
        ];

        match boot_time_seconds() {
            Ok(boot) => families.push(self.family(
                "start_time_seconds",
                "Process start time since unix epoch in seconds",
                MetricKind::Gauge,
                vec![(Vec::new(), boot + stat.starttime as f64 / ticks)],
            )),
            Err(err) => log::warn!("failed to read boot time: {err}"),
        }

        match open_fds() {
            Ok(count) => families.push(self.family(
                "open_fds",
                "Number of open file descriptors",
                MetricKind::Gauge,
                vec![(Vec::new(), count)],
            )),
            Err(err) => log::warn!("failed to count open fds: {err}"),
        }

        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_plausible_process_stats() {
        let collector = ProcessCollector::new("namespace", vec![Label::new("env_role", "test")]);
        let families = collector.collect(&Vec::new());
        assert!(families.len() >= 3);

        let by_name: std::collections::HashMap<&str, &MetricFamily> =
            families.iter().map(|f| (f.name.as_str(), f)).collect();

        let memory = by_name["namespace:memory_bytes"];
        assert_eq!(memory.samples.len(), 2);
        assert!(memory.samples.iter().all(|s| s.value > 0.0));

        let threads = by_name["namespace:threads_total"];
        assert!(threads.samples[0].value >= 1.0);

        if let Some(start) = by_name.get("namespace:start_time_seconds") {
            assert!(start.samples[0].value > 1.0e9);
        }
        if let Some(fds) = by_name.get("namespace:open_fds") {
            assert!(fds.samples[0].value >= 1.0);
        }
    }

    #[test]
    fn namespace_prefixes_names() {
        let collector = ProcessCollector::new("ns", Vec::new());
        assert_eq!(collector.metric_name("test"), "ns:test");

        let bare = ProcessCollector::new("", Vec::new());
        assert_eq!(bare.metric_name("test"), "test");
    }
}
