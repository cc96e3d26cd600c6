//! Projection of accumulators into remote-write series.
//!
//! Each live accumulator becomes one `TimeSeries` with a single sample:
//! the running value at the series' latest timestamp. The label list is
//! built as follows:
//!
//! 1. `__name__` first, holding the wire name from the catalog.
//! 2. The series labels, plus `testid` and `pod`, sorted by name.
//!
//! The run's `testid` and `pod` replace any series label with the same key,
//! and a series label named `__name__` is discarded.

use std::collections::BTreeMap;

use crate::remote_write::proto;
use crate::schema;
use crate::series::SeriesAccumulator;
use crate::table::AggregationTable;

/// Reserved label holding the series name.
pub const NAME_LABEL: &str = "__name__";

/// Label holding the test id.
pub const TEST_ID_LABEL: &str = "testid";

/// Label holding the pod.
pub const POD_LABEL: &str = "pod";

/// Builds a remote-write label list with the name label first.
///
/// Later pairs override earlier pairs with the same key. Pairs keyed
/// `__name__` are ignored.
pub fn build_labels<'a, I>(name: &str, labels: I) -> Vec<proto::Label>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut merged = BTreeMap::new();
    for (key, value) in labels {
        if key == NAME_LABEL {
            continue;
        }
        merged.insert(key, value);
    }

    let mut result = Vec::with_capacity(merged.len() + 1);
    result.push(proto::Label {
        name: NAME_LABEL.to_string(),
        value: name.to_string(),
    });
    result.extend(merged.into_iter().map(|(key, value)| proto::Label {
        name: key.to_string(),
        value: value.to_string(),
    }));

    result
}

/// Converts a nanosecond timestamp to remote-write milliseconds.
pub fn to_millis(timestamp_ns: u64) -> i64 {
    i64::try_from(timestamp_ns / 1_000_000).unwrap_or(i64::MAX)
}

/// Projects one accumulator, or returns `None` if its metric is not
/// exported.
pub fn project(accumulator: &SeriesAccumulator) -> Option<proto::TimeSeries> {
    let key = accumulator.key();
    let wire_name = schema::wire_name(key.name())?;

    let labels = key
        .labels()
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain([
            (TEST_ID_LABEL, accumulator.test_id()),
            (POD_LABEL, accumulator.pod()),
        ]);

    Some(proto::TimeSeries {
        labels: build_labels(wire_name, labels),
        samples: vec![proto::Sample {
            value: accumulator.total_value(),
            timestamp: to_millis(accumulator.latest_timestamp()),
        }],
    })
}

/// Appends every projectable series in the table to `out`.
///
/// Returns the number of series appended.
pub fn append_table(table: &AggregationTable, out: &mut Vec<proto::TimeSeries>) -> usize {
    let before = out.len();
    out.extend(table.iter().filter_map(project));
    out.len() - before
}
