//! Process-health metrics appended to every flush.
//!
//! Reads point-in-time memory and scheduler counters for the current
//! process. On Linux these come from `/proc/self/status` and
//! `/proc/self/fd`; elsewhere only uptime is reported. Readings that cannot
//! be obtained are skipped rather than reported as zero.

use std::time::Instant;

use crate::export::{self, POD_LABEL, TEST_ID_LABEL};
use crate::remote_write::proto;

/// Label identifying the process-health series.
pub const SOURCE_LABEL: &str = "source";

/// Value of the `source` label.
pub const SOURCE: &str = "k6";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory and scheduler counters parsed from `/proc/self/status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessStats {
    /// Resident set size in bytes (`VmRSS`).
    pub rss_bytes: Option<f64>,
    /// Peak resident set size in bytes (`VmHWM`).
    pub rss_peak_bytes: Option<f64>,
    /// Virtual memory size in bytes (`VmSize`).
    pub virtual_bytes: Option<f64>,
    /// Data segment size in bytes (`VmData`).
    pub data_bytes: Option<f64>,
    /// Main-thread stack size in bytes (`VmStk`).
    pub stack_bytes: Option<f64>,
    /// Number of threads.
    pub threads: Option<f64>,
    /// Voluntary context switches.
    pub voluntary_ctx_switches: Option<f64>,
    /// Involuntary context switches.
    pub involuntary_ctx_switches: Option<f64>,
}

impl ProcessStats {
    /// Parses the contents of a `/proc/<pid>/status` file.
    ///
    /// Unknown or malformed lines are ignored.
    pub fn parse(status: &str) -> Self {
        let mut stats = Self::default();
        for line in status.lines() {
            let Some((field, rest)) = line.split_once(':') else {
                continue;
            };
            let rest = rest.trim();
            match field {
                "VmRSS" => stats.rss_bytes = parse_kb(rest),
                "VmHWM" => stats.rss_peak_bytes = parse_kb(rest),
                "VmSize" => stats.virtual_bytes = parse_kb(rest),
                "VmData" => stats.data_bytes = parse_kb(rest),
                "VmStk" => stats.stack_bytes = parse_kb(rest),
                "Threads" => stats.threads = rest.parse().ok(),
                "voluntary_ctxt_switches" => stats.voluntary_ctx_switches = rest.parse().ok(),
                "nonvoluntary_ctxt_switches" => {
                    stats.involuntary_ctx_switches = rest.parse().ok();
                }
                _ => {}
            }
        }
        stats
    }

    /// Reads the current process's status (Linux only).
    pub fn read() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| Self::parse(&status))
            .unwrap_or_default()
    }
}

/// Parses a `"1234 kB"` field into bytes.
fn parse_kb(value: &str) -> Option<f64> {
    let kb: f64 = value.trim_end_matches("kB").trim().parse().ok()?;
    Some(kb * 1024.0)
}

/// Counts open file descriptors via `/proc/self/fd` (Linux only).
#[allow(clippy::cast_precision_loss)]
fn read_open_fds() -> Option<f64> {
    let count = std::fs::read_dir("/proc/self/fd").ok()?.count();
    Some(count as f64)
}

/// Produces the process-health series for each flush.
#[derive(Debug, Clone)]
pub struct HealthSource {
    started: Instant,
    test_id: String,
    pod: String,
}

impl HealthSource {
    /// Creates a source whose uptime counts from now.
    pub fn new(test_id: &str, pod: &str) -> Self {
        Self {
            started: Instant::now(),
            test_id: test_id.to_string(),
            pod: pod.to_string(),
        }
    }

    /// Takes named readings from the current process.
    pub fn readings(&self) -> Vec<(&'static str, f64)> {
        let mut readings = Self::from_stats(&ProcessStats::read());
        if let Some(fds) = read_open_fds() {
            readings.push(("k6_proc_open_fds", fds));
        }
        readings.push(("k6_proc_uptime_seconds", self.started.elapsed().as_secs_f64()));
        readings
    }

    /// Maps parsed stats to wire names, skipping absent values.
    pub fn from_stats(stats: &ProcessStats) -> Vec<(&'static str, f64)> {
        let mb = |bytes: Option<f64>| bytes.map(|b| b / BYTES_PER_MB);
        [
            ("k6_mem_rss_mb", mb(stats.rss_bytes)),
            ("k6_mem_rss_peak_mb", mb(stats.rss_peak_bytes)),
            ("k6_mem_virtual_mb", mb(stats.virtual_bytes)),
            ("k6_mem_data_mb", mb(stats.data_bytes)),
            ("k6_mem_stack_mb", mb(stats.stack_bytes)),
            ("k6_proc_threads", stats.threads),
            ("k6_proc_ctx_switches_voluntary", stats.voluntary_ctx_switches),
            ("k6_proc_ctx_switches_involuntary", stats.involuntary_ctx_switches),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }

    /// Appends one series per reading to `out`, stamped at `now_ns`.
    ///
    /// Returns the number of series appended.
    pub fn append_to(&self, out: &mut Vec<proto::TimeSeries>, now_ns: u64) -> usize {
        let readings = self.readings();
        let count = readings.len();
        let timestamp = export::to_millis(now_ns);

        out.extend(readings.into_iter().map(|(name, value)| proto::TimeSeries {
            labels: export::build_labels(
                name,
                [
                    (SOURCE_LABEL, SOURCE),
                    (TEST_ID_LABEL, self.test_id.as_str()),
                    (POD_LABEL, self.pod.as_str()),
                ],
            ),
            samples: vec![proto::Sample { value, timestamp }],
        }));

        count
    }
}
