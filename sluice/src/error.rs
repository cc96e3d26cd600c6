//! Error types for the sluice metrics aggregator.
//!
//! Only configuration errors are fatal. Remote-write errors surface from a
//! single flush and are logged by the engine; the next tick re-sends the
//! current accumulator state.

use thiserror::Error;

/// The main error type for all sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Error while resolving configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error while pushing a batch to the remote-write endpoint.
    #[error("remote write error: {0}")]
    RemoteWrite(#[from] RemoteWriteError),

    /// Error in the engine lifecycle (start/stop/tick).
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Errors that can occur while resolving the layered configuration.
///
/// All of these abort startup: the engine is never constructed from a
/// configuration that failed to resolve.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The JSON configuration document could not be parsed.
    #[error("parse JSON options failed: {source}")]
    Json {
        /// The underlying JSON parsing error.
        #[source]
        source: serde_json::Error,
    },

    /// A duration value could not be parsed.
    #[error("invalid duration for {key}: {value:?}: {reason}")]
    InvalidDuration {
        /// The option or variable name.
        key: String,
        /// The rejected value.
        value: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A boolean value could not be parsed.
    #[error("{key} value must be true or false, not {value:?}")]
    InvalidBool {
        /// The option or variable name.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// An integer value could not be parsed.
    #[error("invalid integer for {key}: {value:?}")]
    InvalidInteger {
        /// The option or variable name.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A header pair did not follow the `key:value` format.
    #[error("the provided header ({pair}) does not respect the expected format <header key>:<value>")]
    MalformedHeader {
        /// The offending pair.
        pair: String,
    },

    /// An option-string item was not of the form `key=value`.
    #[error("couldn't parse argument {item:?} as option")]
    MalformedOption {
        /// The offending item.
        item: String,
    },

    /// An option-string key is not recognized.
    #[error("{key:?} is an unknown option's key")]
    UnknownKey {
        /// The unrecognized key.
        key: String,
    },

    /// The push interval resolved to zero.
    #[error("push interval must be greater than zero")]
    ZeroPushInterval,
}

/// Errors that can occur during Prometheus remote-write operations.
#[derive(Error, Debug)]
pub enum RemoteWriteError {
    /// Failed to serialize `WriteRequest` to protobuf.
    #[error("failed to serialize write request: {source}")]
    Serialization {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress data with Snappy.
    #[error("failed to compress data: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed before a response was received.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned a non-2xx status.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

/// Errors in the engine lifecycle.
#[derive(Error, Debug)]
pub enum EngineError {
    /// `start` was called on an engine that is already running or stopped.
    #[error("engine already started")]
    AlreadyStarted,

    /// The operation requires a running engine.
    #[error("engine is not running")]
    NotRunning,

    /// The operation requires the flush cycle to be owned by the caller,
    /// but it is currently owned by the flush thread.
    #[error("flush cycle is owned by the running flush thread")]
    CycleBusy,

    /// The flush thread could not be spawned.
    #[error("failed to spawn flush thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The flush thread panicked before completing its final flush.
    #[error("flush thread panicked")]
    FlushThreadPanicked,
}

/// Type alias for `Result<T, SluiceError>`.
pub type Result<T> = std::result::Result<T, SluiceError>;
