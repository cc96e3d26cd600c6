//! Series identity and per-series accumulation.
//!
//! A series is a metric name plus a label set. Samples that share both fold
//! into one [`SeriesAccumulator`], keyed in the table by a [`SeriesKey`].
//!
//! # Update rule
//!
//! - Gauge metrics: the running value is overwritten by each sample.
//! - Cumulative metrics: each sample's value is added to the running value.
//! - The latest timestamp only ever moves forward.
//!
//! Timestamps are nanoseconds since the Unix epoch throughout.

use std::sync::Arc;

use crate::schema::MetricKind;

/// A single measurement produced by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Internal metric name (e.g. `http_reqs`).
    pub name: String,
    /// Label key-value pairs, in any order.
    pub labels: Vec<(String, String)>,
    /// The measured value.
    pub value: f64,
    /// Timestamp in nanoseconds since epoch.
    pub timestamp: u64,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(
        name: impl Into<String>,
        labels: Vec<(String, String)>,
        value: f64,
        timestamp: u64,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
            timestamp,
        }
    }
}

/// Key type for looking up series in the aggregation table.
///
/// Combines series name and labels into a hashable key. Labels are sorted by
/// key so that insertion order does not matter; if a key appears more than
/// once, the last occurrence wins, matching map semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Creates a new series key with canonically ordered labels.
    pub fn new(name: impl Into<String>, labels: &[(String, String)]) -> Self {
        let mut sorted_labels = labels.to_vec();
        // Stable sort keeps duplicates in input order, so the last one
        // survives the reverse dedup below.
        sorted_labels.sort_by(|a, b| a.0.cmp(&b.0));
        sorted_labels.reverse();
        sorted_labels.dedup_by(|a, b| a.0 == b.0);
        sorted_labels.reverse();
        Self {
            name: name.into(),
            labels: sorted_labels,
        }
    }

    /// Returns the key for a sample's series.
    pub fn of(sample: &Sample) -> Self {
        Self::new(sample.name.as_str(), &sample.labels)
    }

    /// The internal metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The labels, sorted by key.
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }
}

/// Running aggregate for one series.
#[derive(Debug, Clone)]
pub struct SeriesAccumulator {
    key: SeriesKey,
    kind: MetricKind,
    total_value: f64,
    latest_timestamp: u64,
    test_id: Arc<str>,
    pod: Arc<str>,
}

impl SeriesAccumulator {
    /// Creates an empty accumulator for a series, tagged with the run's
    /// identifying labels.
    pub fn new(key: SeriesKey, test_id: Arc<str>, pod: Arc<str>) -> Self {
        let kind = MetricKind::of(key.name());
        Self {
            key,
            kind,
            total_value: 0.0,
            latest_timestamp: 0,
            test_id,
            pod,
        }
    }

    /// Folds one measurement into the accumulator.
    ///
    /// A sample older than the current latest timestamp still updates the
    /// value, but does not move the timestamp backwards.
    pub fn apply(&mut self, value: f64, timestamp: u64) {
        match self.kind {
            MetricKind::Gauge => self.total_value = value,
            MetricKind::Cumulative => self.total_value += value,
        }
        if timestamp > self.latest_timestamp {
            self.latest_timestamp = timestamp;
        }
    }

    /// The series identity.
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// The accumulation rule in effect.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// The running value.
    pub fn total_value(&self) -> f64 {
        self.total_value
    }

    /// The newest sample timestamp seen, in nanoseconds since epoch.
    pub fn latest_timestamp(&self) -> u64 {
        self.latest_timestamp
    }

    /// The test id label value.
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// The pod label value.
    pub fn pod(&self) -> &str {
        &self.pod
    }
}
