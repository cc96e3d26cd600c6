//! Prometheus remote-write sink.
//!
//! Serializes a flush batch to the Prometheus remote-write protobuf format,
//! compresses it with snappy, and POSTs it to the configured endpoint.
//!
//! Each flush makes exactly one attempt. A failed push is not retried here;
//! the engine sends the current accumulator state again on its next tick.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sluice::remote_write::{HttpSink, RemoteSink, RemoteWriteConfig, proto};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RemoteWriteConfig::new("http://localhost:8428/api/v1/write")
//!     .with_timeout(Duration::from_secs(5))
//!     .with_header("Authorization", "Bearer token");
//! let mut sink = HttpSink::new(config)?;
//!
//! sink.write(&[proto::TimeSeries {
//!     labels: vec![proto::Label {
//!         name: "__name__".to_string(),
//!         value: "k6_vus".to_string(),
//!     }],
//!     samples: vec![proto::Sample { value: 10.0, timestamp: 1_700_000_000_000 }],
//! }])?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use prost::Message;

use crate::error::{RemoteWriteError, Result};

/// Prometheus remote-write protobuf types.
///
/// Hand-written types matching `prometheus/prompb/remote.proto`.
/// Using prost derives avoids the need for protoc and proto file management.
pub mod proto {
    /// A write request containing one or more time series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// The time series to write.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// A single time series with labels and samples.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Metric labels identifying the series.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Data samples for this series.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// A key-value label pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// A single data sample (value + timestamp).
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// The sample value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Timestamp in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

/// Destination for flush batches.
///
/// The engine calls [`RemoteSink::write`] once per flush with the complete
/// batch. Implementations own whatever transport state they need.
pub trait RemoteSink: Send {
    /// Submits one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be delivered. The engine logs
    /// it and carries on.
    fn write(&mut self, batch: &[proto::TimeSeries]) -> Result<()>;
}

/// Configuration for a Prometheus remote-write endpoint.
#[derive(Debug, Clone)]
pub struct RemoteWriteConfig {
    /// Remote write endpoint URL (e.g., `http://localhost:8428/api/v1/write`).
    pub endpoint: String,
    /// HTTP timeout for write requests.
    pub timeout: Duration,
    /// Skip TLS certificate verification.
    pub insecure_skip_tls_verify: bool,
    /// Extra HTTP headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl RemoteWriteConfig {
    /// Creates a new config with a 5s timeout and TLS verification on.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(5),
            insecure_skip_tls_verify: false,
            headers: Vec::new(),
        }
    }

    /// Adds an HTTP header (e.g., for authentication tokens).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub fn with_insecure_skip_tls_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_tls_verify = skip;
        self
    }
}

/// Remote sink that pushes over HTTP(S).
///
/// Holds one pooled `reqwest` client for the life of the sink.
#[derive(Debug)]
pub struct HttpSink {
    config: RemoteWriteConfig,
    client: reqwest::blocking::Client,
}

impl HttpSink {
    /// Builds the HTTP client for the given endpoint configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteWriteError::ClientCreate`] if the TLS backend or
    /// client cannot be initialized.
    pub fn new(config: RemoteWriteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteWriteError::ClientCreate { source: e })?;

        Ok(Self { config, client })
    }

    /// The endpoint this sink writes to.
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn send(&self, body: Vec<u8>) -> Result<()> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0");

        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let resp = request
            .body(body)
            .send()
            .map_err(|e| RemoteWriteError::RequestFailed { source: e })?;

        let status = resp.status();
        tracing::debug!(status = status.as_u16(), "remote write response");

        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().unwrap_or_default();
        Err(RemoteWriteError::HttpStatus {
            status: status.as_u16(),
            body,
        }
        .into())
    }
}

impl RemoteSink for HttpSink {
    fn write(&mut self, batch: &[proto::TimeSeries]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = encode(batch)?;
        self.send(body)
    }
}

/// Encodes a batch as a Prometheus remote-write payload.
///
/// Returns the snappy-compressed protobuf bytes suitable for HTTP POST.
/// This is useful for testing or custom transport implementations.
///
/// # Errors
///
/// Returns an error if serialization or compression fails.
pub fn encode(batch: &[proto::TimeSeries]) -> Result<Vec<u8>> {
    let request = proto::WriteRequest {
        timeseries: batch.to_vec(),
    };
    let proto_bytes = serialize_write_request(&request)?;
    compress_snappy(&proto_bytes)
}

/// Serializes a `WriteRequest` to protobuf bytes.
fn serialize_write_request(request: &proto::WriteRequest) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| RemoteWriteError::Serialization { source: e })?;
    Ok(buf)
}

/// Compresses bytes using Snappy block format, as remote-write requires.
fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder
        .compress_vec(data)
        .map_err(|e| RemoteWriteError::Compression { source: e })
        .map_err(Into::into)
}
