//! Metric catalog for sluice.
//!
//! The catalog is closed and fixed at compile time. It answers three
//! questions about an internal metric name:
//!
//! - Is it exported at all, and under which wire name? ([`wire_name`])
//! - Does a new sample replace or add to the running value? ([`MetricKind`])
//! - Is the series exempt from age-based eviction? ([`is_preserved`])
//!
//! Names absent from the rename table are never accumulated and never
//! exported. That keeps the series table bounded even when a producer emits
//! metric names with unbounded cardinality.

/// Internal name to wire name, for every metric sluice exports.
const RENAMES: &[(&str, &str)] = &[
    ("vus", "k6_vus"),
    ("vus_max", "k6_vus_max"),
    ("iterations", "k6_iterations_total"),
    ("http_reqs", "k6_http_reqs_total"),
    ("http_req_duration", "k6_http_req_duration"),
    ("http_req_waiting", "k6_http_req_waiting"),
    ("http_req_failed", "k6_http_req_failed"),
    ("http_req_blocked", "k6_http_req_blocked"),
    ("data_sent", "k6_data_sent"),
    ("data_received", "k6_data_received"),
    ("iteration_duration", "k6_iteration_duration"),
    ("dropped_duration", "k6_dropped_duration"),
    ("checks", "k6_checks"),
    ("http_req_sending", "k6_http_req_sending"),
    ("http_req_receiving", "k6_http_req_receiving"),
    ("http_req_tls_handshaking", "k6_http_req_tls_handshaking"),
];

/// Metrics whose latest value supersedes earlier ones.
const GAUGES: &[&str] = &["vus", "vus_max"];

/// Metrics kept in the table for the life of the process.
///
/// These are counter, trend and rate metrics; dropping one from a flush
/// would make the remote store see its running total reset.
const PRESERVED: &[&str] = &[
    "http_reqs",
    "iterations",
    "checks",
    "data_sent",
    "data_received",
    "http_req_duration",
    "http_req_waiting",
    "http_req_connecting",
    "http_req_tls_handshaking",
    "http_req_blocked",
    "http_req_receiving",
    "http_req_sending",
    "iteration_duration",
    "group_duration",
    "ws_sessions",
    "ws_msgs_sent",
    "ws_msgs_received",
    "ws_ping",
    "ws_session_duration",
    "ws_connecting",
    "grpc_req_duration",
    "dropped_iterations",
    "http_req_failed",
];

/// Accumulation rule for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Last value wins.
    Gauge,
    /// Values add up across the life of the series.
    Cumulative,
}

impl MetricKind {
    /// Classifies an internal metric name.
    ///
    /// Anything that is not a known gauge is cumulative.
    pub fn of(name: &str) -> Self {
        if GAUGES.contains(&name) {
            Self::Gauge
        } else {
            Self::Cumulative
        }
    }
}

/// Returns the wire name for an internal metric name, or `None` if the
/// metric is not exported.
pub fn wire_name(name: &str) -> Option<&'static str> {
    RENAMES
        .iter()
        .find(|(internal, _)| *internal == name)
        .map(|(_, wire)| *wire)
}

/// Returns true if the metric is exported (present in the rename table).
pub fn is_exported(name: &str) -> bool {
    wire_name(name).is_some()
}

/// Returns true if series of this metric are exempt from eviction.
pub fn is_preserved(name: &str) -> bool {
    PRESERVED.contains(&name)
}

/// Iterates over every `(internal, wire)` name pair in the catalog.
pub fn renames() -> impl Iterator<Item = (&'static str, &'static str)> {
    RENAMES.iter().copied()
}
