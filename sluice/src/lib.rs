//! # sluice
//!
//! Streaming metrics aggregator with a Prometheus remote-write output.
//!
//! Producers append samples to a shared buffer from any thread. A single
//! flush cycle drains the buffer on a fixed interval, folds the samples into
//! one running value per series, evicts stale series, and pushes every live
//! series plus a handful of process-health readings to a remote-write
//! endpoint.
//!
//! ## Key Properties
//!
//! - Gauges keep their latest value; every other metric accumulates a sum
//! - Closed metric catalog: unknown metric names are dropped on intake
//! - Long-running counters are never evicted, so remote totals never reset
//! - One writer for all series state, no per-series locking
//! - Exactly one final flush on shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use sluice::{Config, Engine, HttpSink, Sample, SampleBuffer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let env: HashMap<String, String> = std::env::vars().collect();
//! let config = Config::resolve(None, &env, Some("pushInterval=2s"))?;
//!
//! let buffer = SampleBuffer::new();
//! let sink = HttpSink::new(config.remote_write_config())?;
//! let mut engine = Engine::new(&config, buffer.clone(), Box::new(sink));
//! engine.start()?;
//!
//! let now = sluice::engine::timestamp_ns();
//! buffer.add(vec![
//!     Sample::new("http_reqs", vec![("status".into(), "200".into())], 1.0, now),
//!     Sample::new("vus", Vec::new(), 10.0, now),
//! ]);
//!
//! engine.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Types
//!
//! - [`Engine`] — Owns the flush thread; `start`, `stop`, `on_tick`
//! - [`FlushCycle`] — Drain, fold, cleanup, serialize, send
//! - [`SampleBuffer`] — Cloneable, thread-safe intake
//! - [`Config`] — Layered configuration
//! - [`RemoteSink`] — Destination for flush batches
//!
//! ## Modules
//!
//! - [`schema`] — Metric catalog: wire names, gauges, preserved set
//! - [`series`] — Samples, series identity, accumulators
//! - [`table`] — Aggregation table with fold and retention
//! - [`intake`] — Producer-side sample buffer
//! - [`export`] — Projection of series to remote-write labels
//! - [`health`] — Process-health readings
//! - [`remote_write`] — Remote-write wire format and HTTP sink
//! - [`config`] — Configuration resolution
//! - [`engine`] — Flush cycle and engine lifecycle
//! - [`error`] — Error types

pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod health;
pub mod intake;
pub mod remote_write;
pub mod schema;
pub mod series;
pub mod table;

// Re-export primary API types at crate root for convenience.
pub use config::Config;
pub use engine::{Engine, EngineState, FlushCycle, FlushReport};
pub use error::{Result, SluiceError};
pub use intake::SampleBuffer;
pub use remote_write::{HttpSink, RemoteSink, RemoteWriteConfig};
pub use series::{Sample, SeriesAccumulator, SeriesKey};
pub use table::AggregationTable;
