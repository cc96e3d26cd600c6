//! The aggregation table: every live series and its accumulator.
//!
//! The table is owned by exactly one flush cycle. Producers never touch it;
//! they append to the [`SampleBuffer`](crate::intake::SampleBuffer) and the
//! cycle folds the drained samples in here.
//!
//! # Retention
//!
//! [`AggregationTable::cleanup`] evicts series whose newest sample is older
//! than a maximum age, except for metrics in the preserved set (see
//! [`schema::is_preserved`](crate::schema::is_preserved)), which stay for the
//! life of the process.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use crate::schema;
use crate::series::{Sample, SeriesAccumulator, SeriesKey};

/// Outcome of folding one batch of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    /// Samples folded into an accumulator.
    pub folded: usize,
    /// Samples dropped because their metric is not exported.
    pub dropped: usize,
    /// Accumulators created by this fold.
    pub created: usize,
}

impl FoldStats {
    fn merge(&mut self, other: FoldStats) {
        self.folded += other.folded;
        self.dropped += other.dropped;
        self.created += other.created;
    }
}

/// Mapping from series identity to its accumulator.
#[derive(Debug)]
pub struct AggregationTable {
    series: HashMap<SeriesKey, SeriesAccumulator>,
    test_id: Arc<str>,
    pod: Arc<str>,
}

impl AggregationTable {
    /// Creates an empty table whose accumulators are tagged with the given
    /// test id and pod.
    pub fn new(test_id: &str, pod: &str) -> Self {
        Self {
            series: HashMap::new(),
            test_id: Arc::from(test_id),
            pod: Arc::from(pod),
        }
    }

    /// Folds samples into the table in iteration order.
    ///
    /// Samples whose metric name is not in the rename table are dropped
    /// without creating an entry. The final state for a series does not
    /// depend on the order of samples within one call.
    pub fn fold<'a, I>(&mut self, samples: I) -> FoldStats
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let mut stats = FoldStats::default();

        for sample in samples {
            if !schema::is_exported(&sample.name) {
                stats.dropped += 1;
                continue;
            }

            let accumulator = match self.series.entry(SeriesKey::of(sample)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    stats.created += 1;
                    let fresh = SeriesAccumulator::new(
                        entry.key().clone(),
                        Arc::clone(&self.test_id),
                        Arc::clone(&self.pod),
                    );
                    entry.insert(fresh)
                }
            };

            accumulator.apply(sample.value, sample.timestamp);
            stats.folded += 1;
        }

        stats
    }

    /// Folds several sample containers, in order.
    pub fn fold_containers(&mut self, containers: &[Vec<Sample>]) -> FoldStats {
        let mut stats = FoldStats::default();
        for container in containers {
            stats.merge(self.fold(container));
        }
        stats
    }

    /// Evicts non-preserved series whose newest sample is older than
    /// `max_age` at time `now` (nanoseconds since epoch).
    ///
    /// Returns the number of series removed.
    pub fn cleanup(&mut self, now: u64, max_age: Duration) -> usize {
        let max_age_ns = u64::try_from(max_age.as_nanos()).unwrap_or(u64::MAX);
        let before = self.series.len();

        self.series.retain(|key, accumulator| {
            schema::is_preserved(key.name())
                || now.saturating_sub(accumulator.latest_timestamp()) <= max_age_ns
        });

        before - self.series.len()
    }

    /// Returns the accumulator for a series, if present.
    pub fn get(&self, key: &SeriesKey) -> Option<&SeriesAccumulator> {
        self.series.get(key)
    }

    /// Iterates over all live accumulators in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &SeriesAccumulator> {
        self.series.values()
    }

    /// Number of live series.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Returns true if the table holds no series.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
