//! Integration tests for the engine lifecycle.
//!
//! These drive the public API end to end: producers append to a shared
//! buffer, the engine folds and flushes, and a recording sink captures every
//! batch that would have gone over the wire.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sluice::remote_write::proto;
use sluice::{Config, Engine, EngineState, FlushCycle, RemoteSink, Result, Sample, SampleBuffer};

const SECOND: u64 = 1_000_000_000;

#[derive(Clone, Default)]
struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<proto::TimeSeries>>>>,
}

impl RecordingSink {
    fn batches(&self) -> Vec<Vec<proto::TimeSeries>> {
        self.batches.lock().unwrap().clone()
    }
}

impl RemoteSink for RecordingSink {
    fn write(&mut self, batch: &[proto::TimeSeries]) -> Result<()> {
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn labels(series: &proto::TimeSeries) -> BTreeMap<&str, &str> {
    series
        .labels
        .iter()
        .map(|l| (l.name.as_str(), l.value.as_str()))
        .collect()
}

fn find<'a>(batch: &'a [proto::TimeSeries], name: &str) -> Option<&'a proto::TimeSeries> {
    batch.iter().find(|s| s.labels[0].value == name)
}

fn config(push_interval: Duration) -> Config {
    Config {
        test_id: "checkout-load".to_string(),
        pod: "runner-7".to_string(),
        push_interval,
        ..Config::default()
    }
}

#[test]
fn test_scenario_single_tick() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let mut engine = Engine::new(&config(Duration::from_secs(5)), buffer.clone(), Box::new(sink.clone()));

    buffer.push(Sample::new("http_reqs", Vec::new(), 1.0, 0));
    buffer.push(Sample::new("http_reqs", Vec::new(), 1.0, SECOND));
    buffer.push(Sample::new("vus", Vec::new(), 10.0, 2 * SECOND));

    let report = engine.on_tick().unwrap();
    assert_eq!(report.folded, 3);
    assert!(report.sent);

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);

    let reqs = find(&batches[0], "k6_http_reqs_total").unwrap();
    assert_eq!(reqs.samples[0].value, 2.0);
    assert_eq!(reqs.samples[0].timestamp, 1_000);
    assert_eq!(labels(reqs)["testid"], "checkout-load");
    assert_eq!(labels(reqs)["pod"], "runner-7");

    let vus = find(&batches[0], "k6_vus").unwrap();
    assert_eq!(vus.samples[0].value, 10.0);
    assert_eq!(vus.samples[0].timestamp, 2_000);
    assert_eq!(labels(vus)["testid"], "checkout-load");
}

#[test]
fn test_unknown_metric_produces_nothing() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let mut engine = Engine::new(&config(Duration::from_secs(5)), buffer.clone(), Box::new(sink.clone()));

    buffer.push(Sample::new("custom_thing", Vec::new(), 1.0, SECOND));
    let report = engine.on_tick().unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(report.folded, 0);
    assert!(engine.cycle().unwrap().table().is_empty());
    assert!(find(&sink.batches()[0], "custom_thing").is_none());
}

#[test]
fn test_label_sets_are_distinct_series() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let mut engine = Engine::new(&config(Duration::from_secs(5)), buffer.clone(), Box::new(sink.clone()));

    let ok = vec![("status".to_string(), "200".to_string()), ("method".to_string(), "GET".to_string())];
    let ok_reordered = vec![("method".to_string(), "GET".to_string()), ("status".to_string(), "200".to_string())];
    let err = vec![("status".to_string(), "500".to_string()), ("method".to_string(), "GET".to_string())];

    buffer.add(vec![
        Sample::new("http_reqs", ok, 1.0, SECOND),
        Sample::new("http_reqs", ok_reordered, 1.0, SECOND),
        Sample::new("http_reqs", err, 1.0, SECOND),
    ]);
    engine.on_tick().unwrap();

    let batch = &sink.batches()[0];
    let reqs: Vec<_> = batch
        .iter()
        .filter(|s| s.labels[0].value == "k6_http_reqs_total")
        .collect();
    assert_eq!(reqs.len(), 2);

    let ok = reqs.iter().find(|s| labels(s)["status"] == "200").unwrap();
    assert_eq!(ok.samples[0].value, 2.0);
    let names: Vec<_> = ok.labels.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["__name__", "method", "pod", "status", "testid"]);
}

#[test]
fn test_totals_grow_across_ticks() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let mut engine = Engine::new(&config(Duration::from_secs(5)), buffer.clone(), Box::new(sink.clone()));

    buffer.push(Sample::new("data_sent", Vec::new(), 100.0, SECOND));
    buffer.push(Sample::new("vus", Vec::new(), 5.0, SECOND));
    engine.on_tick().unwrap();

    // Nothing new: the same totals are sent again.
    engine.on_tick().unwrap();

    buffer.push(Sample::new("data_sent", Vec::new(), 50.0, 3 * SECOND));
    buffer.push(Sample::new("vus", Vec::new(), 2.0, 3 * SECOND));
    engine.on_tick().unwrap();

    let batches = sink.batches();
    let sent: Vec<f64> = batches
        .iter()
        .map(|b| find(b, "k6_data_sent").unwrap().samples[0].value)
        .collect();
    let vus: Vec<f64> = batches
        .iter()
        .map(|b| find(b, "k6_vus").unwrap().samples[0].value)
        .collect();

    assert_eq!(sent, vec![100.0, 100.0, 150.0]);
    assert_eq!(vus, vec![5.0, 5.0, 2.0]);
}

#[test]
fn test_shutdown_flushes_exactly_once() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let mut engine = Engine::new(&config(Duration::from_secs(3600)), buffer.clone(), Box::new(sink.clone()));

    engine.start().unwrap();
    buffer.push(Sample::new("iterations", Vec::new(), 7.0, SECOND));
    let report = engine.stop().unwrap();

    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(report.folded, 1);

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        find(&batches[0], "k6_iterations_total").unwrap().samples[0].value,
        7.0
    );

    // Samples arriving after shutdown are never flushed.
    buffer.push(Sample::new("iterations", Vec::new(), 1.0, 2 * SECOND));
    assert!(engine.on_tick().is_err());
    assert_eq!(sink.batches().len(), 1);
}

#[test]
fn test_concurrent_producers_with_running_engine() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let mut engine = Engine::new(&config(Duration::from_millis(10)), buffer.clone(), Box::new(sink.clone()));

    engine.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 0..250u64 {
                    buffer.push(Sample::new("http_reqs", Vec::new(), 1.0, i * SECOND));
                    if i % 50 == 0 {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().unwrap();
    }

    engine.stop().unwrap();

    let batches = sink.batches();
    let last = batches.last().unwrap();
    assert_eq!(
        find(last, "k6_http_reqs_total").unwrap().samples[0].value,
        1000.0
    );
}

#[test]
fn test_preserved_series_survive_cleanup() {
    let sink = RecordingSink::default();
    let buffer = SampleBuffer::new();
    let clock = Arc::new(Mutex::new(10_000 * SECOND));
    let reading = Arc::clone(&clock);

    let cycle = FlushCycle::new(&config(Duration::from_secs(5)), buffer.clone(), Box::new(sink.clone()))
        .with_clock(move || *reading.lock().unwrap());
    let mut engine = Engine::from_cycle(cycle, "http://vm/write");

    buffer.add(vec![
        Sample::new("http_reqs", Vec::new(), 1.0, SECOND),
        Sample::new("vus_max", Vec::new(), 20.0, SECOND),
        Sample::new("vus", Vec::new(), 3.0, 9_990 * SECOND),
    ]);

    *clock.lock().unwrap() += 120 * SECOND;
    let report = engine.on_tick().unwrap();

    // vus_max is stale; vus is within the window; http_reqs is preserved.
    assert_eq!(report.evicted, 1);
    let batch = &sink.batches()[0];
    assert!(find(batch, "k6_http_reqs_total").is_some());
    assert!(find(batch, "k6_vus").is_some());
    assert!(find(batch, "k6_vus_max").is_none());
}
