//! CLI host for the sluice metrics aggregator.
//!
//! Reads samples from stdin, aggregates them with a sluice engine and pushes
//! them to a Prometheus remote-write endpoint.

use std::collections::HashMap;
use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use sluice::{Config, Engine, HttpSink, Sample, SampleBuffer};

/// sluice — Streaming metrics aggregator with Prometheus remote-write output.
#[derive(Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset (e.g. "debug", "sluice=trace").
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Aggregate samples read from stdin until EOF.
    ///
    /// Each line is `name{key=value,...} value [timestamp_ms]`. Labels and
    /// timestamp are optional; a missing timestamp means now.
    Run {
        /// JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Option string, e.g. "url=http://vm:8428/api/v1/write,pushInterval=2s".
        #[arg(long)]
        options: Option<String>,
    },

    /// Print the resolved configuration as JSON.
    Config {
        /// JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Option string.
        #[arg(long)]
        options: Option<String>,
    },

    /// Print the version.
    Version,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match cli.command {
        Commands::Run { config, options } => cmd_run(config.as_deref(), options.as_deref()),
        Commands::Config { config, options } => cmd_config(config.as_deref(), options.as_deref()),
        Commands::Version => {
            println!("sluice {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves configuration from the file, the process environment and the
/// option string.
fn load_config(path: Option<&Path>, options: Option<&str>) -> Result<Config, Box<dyn Error>> {
    let json = path
        .map(|p| {
            std::fs::read_to_string(p)
                .map_err(|e| format!("cannot read config file '{}': {e}", p.display()))
        })
        .transpose()?;
    let env: HashMap<String, String> = std::env::vars().collect();

    Ok(Config::resolve(json.as_deref(), &env, options)?)
}

/// Implements `sluice config`.
fn cmd_config(path: Option<&Path>, options: Option<&str>) -> Result<(), Box<dyn Error>> {
    let config = load_config(path, options)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Implements `sluice run`.
fn cmd_run(path: Option<&Path>, options: Option<&str>) -> Result<(), Box<dyn Error>> {
    let config = load_config(path, options)?;
    let sink = HttpSink::new(config.remote_write_config())?;
    let buffer = SampleBuffer::new();

    let mut engine = Engine::new(&config, buffer.clone(), Box::new(sink));
    tracing::info!(output = engine.description(), test_id = %config.test_id, "starting");
    engine.start()?;

    let mut accepted = 0u64;
    let mut rejected = 0u64;
    for (index, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line, sluice::engine::timestamp_ns()) {
            Ok(sample) => {
                buffer.push(sample);
                accepted += 1;
            }
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping malformed sample");
                rejected += 1;
            }
        }
    }

    let report = engine.stop()?;
    tracing::info!(
        accepted,
        rejected,
        series = report.series,
        sent = report.sent,
        "input closed"
    );
    Ok(())
}

/// Parses `name{key=value,...} value [timestamp_ms]`.
///
/// `now_ns` is used when the line carries no timestamp.
fn parse_line(line: &str, now_ns: u64) -> Result<Sample, Box<dyn Error>> {
    let (name, labels, rest) = match line.find(['{', ' ', '\t']) {
        Some(open) if line[open..].starts_with('{') => {
            let close = line[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or("unterminated label set")?;
            let labels = parse_labels(&line[open + 1..close])?;
            (&line[..open], labels, &line[close + 1..])
        }
        Some(space) => (&line[..space], Vec::new(), &line[space..]),
        None => return Err("missing value".into()),
    };

    if name.is_empty() {
        return Err("missing metric name".into());
    }

    let mut fields = rest.split_whitespace();
    let value: f64 = fields
        .next()
        .ok_or("missing value")?
        .parse()
        .map_err(|e| format!("invalid value: {e}"))?;
    let timestamp = match fields.next() {
        Some(ms) => {
            let ms: u64 = ms.parse().map_err(|e| format!("invalid timestamp: {e}"))?;
            ms.checked_mul(1_000_000).ok_or("timestamp out of range")?
        }
        None => now_ns,
    };
    if fields.next().is_some() {
        return Err("unexpected trailing fields".into());
    }

    Ok(Sample::new(name, labels, value, timestamp))
}

fn parse_labels(text: &str) -> Result<Vec<(String, String)>, Box<dyn Error>> {
    text.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> Result<(String, String), Box<dyn Error>> {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("label {pair:?} is not key=value"))?;
            let value = value.trim().trim_matches('"');
            Ok((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
