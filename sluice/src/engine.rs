//! The flush engine.
//!
//! [`FlushCycle`] is the single writer: it owns the aggregation table and
//! the cleanup marker, and runs drain → fold → cleanup → serialize → send
//! once per call. [`Engine`] drives a cycle from a dedicated thread on a
//! fixed push interval, or inline through [`Engine::on_tick`] when no thread
//! is running.
//!
//! Shutdown is a message on a channel. The flush thread finishes any cycle
//! in progress, runs exactly one final flush, and hands the cycle back to
//! the caller.
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice::{Config, Engine, HttpSink, Sample, SampleBuffer};
//! use std::collections::HashMap;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::resolve(None, &HashMap::new(), None)?;
//! let sink = HttpSink::new(config.remote_write_config())?;
//! let buffer = SampleBuffer::new();
//!
//! let mut engine = Engine::new(&config, buffer.clone(), Box::new(sink));
//! engine.start()?;
//!
//! buffer.push(Sample::new("http_reqs", Vec::new(), 1.0, sluice::engine::timestamp_ns()));
//!
//! let report = engine.stop()?;
//! println!("final flush sent {} series", report.series);
//! # Ok(())
//! # }
//! ```

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::export;
use crate::health::HealthSource;
use crate::intake::SampleBuffer;
use crate::remote_write::{RemoteSink, proto};
use crate::table::AggregationTable;

/// Upper bound on the batch capacity reserved up front. `batch_size` is only
/// a hint; larger batches still grow on demand.
pub const MAX_BATCH_CAPACITY: usize = 65_536;

/// Wall-clock source in nanoseconds since the Unix epoch.
pub type Clock = Box<dyn Fn() -> u64 + Send>;

/// Returns the current wall-clock time in nanoseconds since the Unix epoch.
pub fn timestamp_ns() -> u64 {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_secs() * 1_000_000_000 + u64::from(dur.subsec_nanos())
}

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Samples drained from the intake buffer.
    pub drained: usize,
    /// Samples folded into the table.
    pub folded: usize,
    /// Samples dropped because their metric is not exported.
    pub dropped: usize,
    /// Series evicted by retention (zero when cleanup was not due).
    pub evicted: usize,
    /// Series in the outbound batch, process-health included.
    pub series: usize,
    /// Whether the sink accepted the batch.
    pub sent: bool,
    /// Wall-clock duration of the flush.
    pub elapsed: Duration,
}

/// One flush pipeline and all the state it mutates.
pub struct FlushCycle {
    table: AggregationTable,
    buffer: SampleBuffer,
    sink: Box<dyn RemoteSink>,
    health: HealthSource,
    push_interval: Duration,
    cleanup_interval: Duration,
    max_series_age: Duration,
    last_cleanup: u64,
    clock: Clock,
    batch: Vec<proto::TimeSeries>,
}

impl std::fmt::Debug for FlushCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushCycle")
            .field("series", &self.table.len())
            .field("push_interval", &self.push_interval)
            .field("last_cleanup", &self.last_cleanup)
            .finish_non_exhaustive()
    }
}

impl FlushCycle {
    /// Creates a cycle draining `buffer` into a fresh table and pushing to
    /// `sink`.
    pub fn new(config: &Config, buffer: SampleBuffer, sink: Box<dyn RemoteSink>) -> Self {
        Self {
            table: AggregationTable::new(&config.test_id, &config.pod),
            buffer,
            sink,
            health: HealthSource::new(&config.test_id, &config.pod),
            push_interval: config.push_interval,
            cleanup_interval: config.cleanup_interval,
            max_series_age: config.max_series_age,
            last_cleanup: timestamp_ns(),
            clock: Box::new(timestamp_ns),
            batch: Vec::with_capacity(config.batch_size.min(MAX_BATCH_CAPACITY)),
        }
    }

    /// Replaces the wall clock and restarts the cleanup throttle from it.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + 'static) -> Self {
        self.last_cleanup = clock();
        self.clock = Box::new(clock);
        self
    }

    /// Runs one complete flush.
    ///
    /// A failed push is logged and reported in [`FlushReport::sent`]; the
    /// table is left as it was, so the next flush sends the same totals.
    pub fn flush(&mut self) -> FlushReport {
        let started = Instant::now();

        let containers = self.buffer.drain();
        let drained = containers.iter().map(Vec::len).sum();
        let stats = self.table.fold_containers(&containers);
        drop(containers);

        let now = (self.clock)();
        let evicted = self.maybe_cleanup(now);

        self.batch.clear();
        export::append_table(&self.table, &mut self.batch);
        self.health.append_to(&mut self.batch, now);
        let series = self.batch.len();

        let sent = match self.sink.write(&self.batch) {
            Ok(()) => {
                tracing::debug!(series, "remote write succeeded");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, series, "remote write failed");
                false
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.push_interval {
            tracing::warn!(
                elapsed = ?elapsed,
                interval = ?self.push_interval,
                series,
                "flush took longer than the push interval"
            );
        }

        tracing::debug!(
            drained,
            folded = stats.folded,
            dropped = stats.dropped,
            evicted,
            series,
            elapsed = ?elapsed,
            "flush complete"
        );

        FlushReport {
            drained,
            folded: stats.folded,
            dropped: stats.dropped,
            evicted,
            series,
            sent,
            elapsed,
        }
    }

    fn maybe_cleanup(&mut self, now: u64) -> usize {
        let interval_ns = u64::try_from(self.cleanup_interval.as_nanos()).unwrap_or(u64::MAX);
        if now.saturating_sub(self.last_cleanup) <= interval_ns {
            return 0;
        }

        self.last_cleanup = now;
        let evicted = self.table.cleanup(now, self.max_series_age);
        tracing::debug!(evicted, remaining = self.table.len(), "series cleanup");
        evicted
    }

    /// The aggregation table.
    pub fn table(&self) -> &AggregationTable {
        &self.table
    }

    /// Interval between scheduled flushes.
    pub fn push_interval(&self) -> Duration {
        self.push_interval
    }
}

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed; ticks run inline.
    Idle,
    /// The flush thread owns the cycle.
    Running,
    /// The final flush has run. No further flushes happen.
    Stopped,
}

struct Worker {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<(FlushCycle, FlushReport)>,
}

/// Runs a [`FlushCycle`] on a fixed interval.
pub struct Engine {
    state: EngineState,
    cycle: Option<FlushCycle>,
    worker: Option<Worker>,
    description: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an idle engine for the given configuration.
    pub fn new(config: &Config, buffer: SampleBuffer, sink: Box<dyn RemoteSink>) -> Self {
        Self::from_cycle(FlushCycle::new(config, buffer, sink), &config.url)
    }

    /// Creates an idle engine around an existing cycle.
    pub fn from_cycle(cycle: FlushCycle, url: &str) -> Self {
        Self {
            state: EngineState::Idle,
            cycle: Some(cycle),
            worker: None,
            description: format!("Prometheus remote write ({url})"),
        }
    }

    /// Human-readable description of the output.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The cycle, when no flush thread holds it.
    pub fn cycle(&self) -> Option<&FlushCycle> {
        self.cycle.as_ref()
    }

    /// Starts the flush thread.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] unless the engine is idle,
    /// or [`EngineError::Spawn`] if the thread cannot be created. A failed
    /// spawn leaves the engine stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.state != EngineState::Idle {
            return Err(EngineError::AlreadyStarted.into());
        }
        let Some(cycle) = self.cycle.take() else {
            return Err(EngineError::AlreadyStarted.into());
        };

        let interval = cycle.push_interval();
        let (shutdown, signal) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("sluice-flush".to_string())
            .spawn(move || flush_loop(cycle, &signal, interval))
            .map_err(|e| {
                self.state = EngineState::Stopped;
                EngineError::Spawn { source: e }
            })?;

        self.worker = Some(Worker { shutdown, handle });
        self.state = EngineState::Running;
        tracing::info!(interval = ?interval, output = %self.description, "engine started");
        Ok(())
    }

    /// Stops the engine after one final flush and returns its report.
    ///
    /// An engine that was never started flushes inline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] if already stopped, or
    /// [`EngineError::FlushThreadPanicked`] if the flush thread died.
    pub fn stop(&mut self) -> Result<FlushReport> {
        let report = match self.state {
            EngineState::Stopped => return Err(EngineError::NotRunning.into()),
            EngineState::Idle => {
                let cycle = self.cycle.as_mut().ok_or(EngineError::NotRunning)?;
                cycle.flush()
            }
            EngineState::Running => {
                let worker = self.worker.take().ok_or(EngineError::NotRunning)?;
                // The loop also exits when the sender is dropped.
                let _ = worker.shutdown.send(());
                let joined = worker.handle.join();
                self.state = EngineState::Stopped;
                let (cycle, report) = joined.map_err(|_| EngineError::FlushThreadPanicked)?;
                self.cycle = Some(cycle);
                report
            }
        };

        self.state = EngineState::Stopped;
        tracing::info!(series = report.series, sent = report.sent, "engine stopped");
        Ok(report)
    }

    /// Runs one flush inline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CycleBusy`] while the flush thread is running
    /// and [`EngineError::NotRunning`] once stopped.
    pub fn on_tick(&mut self) -> Result<FlushReport> {
        match self.state {
            EngineState::Running => Err(EngineError::CycleBusy.into()),
            EngineState::Stopped => Err(EngineError::NotRunning.into()),
            EngineState::Idle => {
                let cycle = self.cycle.as_mut().ok_or(EngineError::NotRunning)?;
                Ok(cycle.flush())
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state == EngineState::Running
            && let Err(e) = self.stop()
        {
            tracing::warn!(error = %e, "engine shutdown on drop failed");
        }
    }
}

/// Flushes every `interval` until a shutdown message arrives or the sender
/// is dropped, then flushes once more.
///
/// Ticks that fall due while a slow flush is running collapse into a single
/// immediate flush, after which the schedule restarts from that point.
fn flush_loop(
    mut cycle: FlushCycle,
    shutdown: &mpsc::Receiver<()>,
    interval: Duration,
) -> (FlushCycle, FlushReport) {
    let mut next = Instant::now() + interval;

    loop {
        let wait = next.saturating_duration_since(Instant::now());
        match shutdown.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                cycle.flush();
                let now = Instant::now();
                next += interval;
                if next <= now {
                    next = now;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = cycle.flush();
    (cycle, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SluiceError;
    use crate::series::Sample;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    const SECOND: u64 = 1_000_000_000;

    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<Vec<proto::TimeSeries>>>>,
        fail: bool,
    }

    impl RemoteSink for RecordingSink {
        fn write(&mut self, batch: &[proto::TimeSeries]) -> Result<()> {
            self.batches.lock().unwrap().push(batch.to_vec());
            if self.fail {
                return Err(crate::error::RemoteWriteError::HttpStatus {
                    status: 503,
                    body: "unavailable".to_string(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn value_of(batch: &[proto::TimeSeries], name: &str) -> Option<f64> {
        batch
            .iter()
            .find(|s| s.labels[0].value == name)
            .map(|s| s.samples[0].value)
    }

    fn config() -> Config {
        Config {
            test_id: "run-1".to_string(),
            pod: "pod-1".to_string(),
            push_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    fn fixed_clock(now: &Arc<AtomicU64>) -> impl Fn() -> u64 + Send + 'static {
        let now = Arc::clone(now);
        move || now.load(Ordering::SeqCst)
    }

    #[test]
    fn test_flush_folds_and_sends() {
        let sink = RecordingSink::default();
        let buffer = SampleBuffer::new();
        let mut cycle = FlushCycle::new(&config(), buffer.clone(), Box::new(sink.clone()));

        buffer.add(vec![
            Sample::new("http_reqs", Vec::new(), 1.0, 0),
            Sample::new("http_reqs", Vec::new(), 1.0, SECOND),
        ]);
        buffer.push(Sample::new("vus", Vec::new(), 10.0, 2 * SECOND));
        buffer.push(Sample::new("custom_thing", Vec::new(), 5.0, 2 * SECOND));

        let report = cycle.flush();

        assert_eq!(report.drained, 4);
        assert_eq!(report.folded, 3);
        assert_eq!(report.dropped, 1);
        assert!(report.sent);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(report.series, batch.len());
        assert_eq!(value_of(batch, "k6_http_reqs_total"), Some(2.0));
        assert_eq!(value_of(batch, "k6_vus"), Some(10.0));
        assert!(value_of(batch, "custom_thing").is_none());
        assert!(value_of(batch, "k6_proc_uptime_seconds").is_some());
    }

    #[test]
    fn test_failed_push_keeps_totals() {
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        let buffer = SampleBuffer::new();
        let mut cycle = FlushCycle::new(&config(), buffer.clone(), Box::new(sink.clone()));

        buffer.push(Sample::new("iterations", Vec::new(), 3.0, SECOND));
        assert!(!cycle.flush().sent);

        buffer.push(Sample::new("iterations", Vec::new(), 2.0, 2 * SECOND));
        assert!(!cycle.flush().sent);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(value_of(&batches[0], "k6_iterations_total"), Some(3.0));
        assert_eq!(value_of(&batches[1], "k6_iterations_total"), Some(5.0));
    }

    #[test]
    fn test_cleanup_is_throttled() {
        let now = Arc::new(AtomicU64::new(1_000 * SECOND));
        let buffer = SampleBuffer::new();
        let mut cycle = FlushCycle::new(&config(), buffer.clone(), Box::new(RecordingSink::default()))
            .with_clock(fixed_clock(&now));

        // Both samples are older than the 10 minute max age.
        buffer.push(Sample::new("vus", Vec::new(), 1.0, 0));
        buffer.push(Sample::new("http_reqs", Vec::new(), 1.0, 0));

        now.fetch_add(30 * SECOND, Ordering::SeqCst);
        let report = cycle.flush();
        assert_eq!(report.evicted, 0);
        assert_eq!(cycle.table().len(), 2);

        now.fetch_add(31 * SECOND, Ordering::SeqCst);
        let report = cycle.flush();
        assert_eq!(report.evicted, 1);
        assert_eq!(cycle.table().len(), 1);

        // The marker moved; an immediate second flush does not sweep.
        buffer.push(Sample::new("vus", Vec::new(), 1.0, 0));
        now.fetch_add(SECOND, Ordering::SeqCst);
        assert_eq!(cycle.flush().evicted, 0);
        assert_eq!(cycle.table().len(), 2);
    }

    #[test]
    fn test_batch_capacity_is_reused() {
        let buffer = SampleBuffer::new();
        let mut cycle = FlushCycle::new(&config(), buffer, Box::new(RecordingSink::default()));
        let capacity = cycle.batch.capacity();
        assert!(capacity >= 1000);

        cycle.flush();
        cycle.flush();
        assert_eq!(cycle.batch.capacity(), capacity);
    }

    #[test]
    fn test_oversized_batch_hint_is_clamped() {
        let config = Config {
            batch_size: usize::MAX,
            ..config()
        };
        let cycle = FlushCycle::new(&config, SampleBuffer::new(), Box::new(RecordingSink::default()));
        assert!(cycle.batch.capacity() >= MAX_BATCH_CAPACITY);
        assert!(cycle.batch.capacity() < usize::MAX / 2);

        let config = Config {
            batch_size: 10_000_000_000,
            ..config
        };
        let cycle = FlushCycle::new(&config, SampleBuffer::new(), Box::new(RecordingSink::default()));
        assert!(cycle.batch.capacity() < 10_000_000_000);
    }

    /// Records the start and end of every write and sleeps in between.
    #[derive(Clone)]
    struct SlowSink {
        delay: Duration,
        writes: Arc<Mutex<Vec<(Instant, Instant)>>>,
    }

    impl RemoteSink for SlowSink {
        fn write(&mut self, _batch: &[proto::TimeSeries]) -> Result<()> {
            let started = Instant::now();
            std::thread::sleep(self.delay);
            self.writes.lock().unwrap().push((started, Instant::now()));
            Ok(())
        }
    }

    #[test]
    fn test_slow_flush_reports_elapsed_over_interval() {
        let sink = SlowSink {
            delay: Duration::from_millis(60),
            writes: Arc::default(),
        };
        let mut cycle = FlushCycle::new(&config(), SampleBuffer::new(), Box::new(sink));

        let report = cycle.flush();

        assert!(report.sent);
        assert!(report.elapsed > cycle.push_interval());
    }

    #[test]
    fn test_slow_sink_flushes_never_overlap_or_burst() {
        let interval = Duration::from_millis(20);
        let delay = Duration::from_millis(70);
        let sink = SlowSink {
            delay,
            writes: Arc::default(),
        };
        let writes = Arc::clone(&sink.writes);
        let config = Config {
            push_interval: interval,
            ..config()
        };
        let mut engine = Engine::new(&config, SampleBuffer::new(), Box::new(sink));

        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(400));
        engine.stop().unwrap();

        let writes = writes.lock().unwrap();
        // Roughly 400ms / 70ms scheduled flushes plus the final one; a burst
        // of queued ticks (400ms / 20ms) would far exceed this.
        assert!(writes.len() >= 3, "only {} flushes", writes.len());
        assert!(writes.len() <= 8, "{} flushes", writes.len());
        for pair in writes.windows(2) {
            let (_, prev_end) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start >= prev_end, "flushes overlapped");
        }
    }

    #[test]
    fn test_on_tick_inline_when_idle() {
        let sink = RecordingSink::default();
        let buffer = SampleBuffer::new();
        let mut engine = Engine::new(&config(), buffer.clone(), Box::new(sink.clone()));

        assert_eq!(engine.state(), EngineState::Idle);
        buffer.push(Sample::new("checks", Vec::new(), 1.0, SECOND));
        let report = engine.on_tick().unwrap();

        assert_eq!(report.folded, 1);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(engine.cycle().unwrap().table().len(), 1);
    }

    #[test]
    fn test_description_names_endpoint() {
        let engine = Engine::new(&config(), SampleBuffer::new(), Box::new(RecordingSink::default()));
        assert_eq!(
            engine.description(),
            "Prometheus remote write (http://localhost:8428/api/v1/write)"
        );
    }

    #[test]
    fn test_start_stop_runs_final_flush() {
        let sink = RecordingSink::default();
        let buffer = SampleBuffer::new();
        let config = Config {
            push_interval: Duration::from_secs(3600),
            ..config()
        };
        let mut engine = Engine::new(&config, buffer.clone(), Box::new(sink.clone()));

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.cycle().is_none());
        assert!(matches!(
            engine.on_tick(),
            Err(SluiceError::Engine(EngineError::CycleBusy))
        ));

        buffer.push(Sample::new("http_reqs", Vec::new(), 4.0, SECOND));
        let report = engine.stop().unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(report.folded, 1);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(value_of(&batches[0], "k6_http_reqs_total"), Some(4.0));
        assert_eq!(engine.cycle().unwrap().table().len(), 1);
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut engine = Engine::new(&config(), SampleBuffer::new(), Box::new(RecordingSink::default()));

        engine.start().unwrap();
        assert!(matches!(
            engine.start(),
            Err(SluiceError::Engine(EngineError::AlreadyStarted))
        ));

        engine.stop().unwrap();
        assert!(matches!(
            engine.stop(),
            Err(SluiceError::Engine(EngineError::NotRunning))
        ));
        assert!(matches!(
            engine.on_tick(),
            Err(SluiceError::Engine(EngineError::NotRunning))
        ));
        assert!(matches!(
            engine.start(),
            Err(SluiceError::Engine(EngineError::AlreadyStarted))
        ));
    }

    #[test]
    fn test_stop_without_start_flushes_once() {
        let sink = RecordingSink::default();
        let mut engine = Engine::new(&config(), SampleBuffer::new(), Box::new(sink.clone()));

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_running_engine_ticks() {
        let sink = RecordingSink::default();
        let mut engine = Engine::new(&config(), SampleBuffer::new(), Box::new(sink.clone()));

        engine.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.batches.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop().unwrap();

        // At least two ticks plus the final flush.
        assert!(sink.batches.lock().unwrap().len() >= 3);
    }

    #[test]
    fn test_timestamp_ns_is_recent() {
        // 2020-09-13 in nanoseconds.
        assert!(timestamp_ns() > 1_600_000_000 * SECOND);
    }
}
