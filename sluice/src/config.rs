//! Layered configuration for the sluice engine.
//!
//! The configuration is resolved once at startup and never changes for the
//! life of the engine. Sources are applied in increasing precedence:
//!
//! 1. Built-in defaults
//! 2. JSON document
//! 3. Option string (`key=value,key=value`)
//! 4. Environment variables
//!
//! A later layer replaces scalar values from earlier layers. Headers merge
//! key by key. Any malformed value aborts resolution with a
//! [`ConfigError`] naming the offending key.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use sluice::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let env = HashMap::from([("SLUICE_POD".to_string(), "worker-3".to_string())]);
//! let config = Config::resolve(
//!     Some(r#"{"pushInterval": "10s", "testId": "smoke"}"#),
//!     &env,
//!     Some("headers.X-Scope-OrgID=team-a"),
//! )?;
//!
//! assert_eq!(config.push_interval, Duration::from_secs(10));
//! assert_eq!(config.test_id, "smoke");
//! assert_eq!(config.pod, "worker-3");
//! assert_eq!(config.headers["X-Scope-OrgID"], "team-a");
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ConfigError, Result};
use crate::remote_write::RemoteWriteConfig;

/// Default remote-write endpoint.
pub const DEFAULT_URL: &str = "http://localhost:8428/api/v1/write";
/// Default interval between flushes.
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Default HTTP timeout for a push.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default capacity hint for flush batches.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default test id label value.
pub const DEFAULT_TEST_ID: &str = "sluice-test";
/// Default pod label value.
pub const DEFAULT_POD: &str = "sluice-pod";
/// Default minimum time between retention sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Default age after which a non-preserved series is evicted.
pub const DEFAULT_MAX_SERIES_AGE: Duration = Duration::from_secs(600);

const ENV_URL: &str = "SLUICE_METRICS_URL";
const ENV_PUSH_INTERVAL: &str = "SLUICE_METRICS_PUSH_INTERVAL";
const ENV_TEST_ID: &str = "SLUICE_TESTID";
const ENV_POD: &str = "SLUICE_POD";
const ENV_BATCH_SIZE: &str = "SLUICE_BATCH_SIZE";
const ENV_INSECURE_SKIP_TLS_VERIFY: &str = "SLUICE_INSECURE_SKIP_TLS_VERIFY";
const ENV_CLEANUP_INTERVAL: &str = "SLUICE_CLEANUP_INTERVAL";
const ENV_MAX_SERIES_AGE: &str = "SLUICE_MAX_SERIES_AGE";
const ENV_HEADERS: &str = "SLUICE_HEADERS";
const ENV_HEADER_PREFIX: &str = "SLUICE_HEADERS_";

/// Fully resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Remote-write endpoint URL.
    pub url: String,
    /// Skip TLS certificate verification for the endpoint.
    #[serde(rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
    /// Interval between flushes.
    #[serde(serialize_with = "serialize_duration")]
    pub push_interval: Duration,
    /// HTTP timeout for a push.
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
    /// Value of the `testid` label on every exported series.
    pub test_id: String,
    /// Value of the `pod` label on every exported series.
    pub pod: String,
    /// Initial capacity of the reusable flush batch.
    pub batch_size: usize,
    /// Minimum time between retention sweeps.
    #[serde(serialize_with = "serialize_duration")]
    pub cleanup_interval: Duration,
    /// Age after which a non-preserved series is evicted.
    #[serde(serialize_with = "serialize_duration")]
    pub max_series_age: Duration,
    /// Extra HTTP headers sent with every push.
    pub headers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            insecure_skip_tls_verify: false,
            push_interval: DEFAULT_PUSH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            test_id: DEFAULT_TEST_ID.to_string(),
            pod: DEFAULT_POD.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_series_age: DEFAULT_MAX_SERIES_AGE,
            headers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Resolves the configuration from every layer.
    ///
    /// `json` and `options` may be `None` (or empty) when the host has no
    /// such source. `env` is typically the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any layer contains a malformed value, an
    /// option string names an unknown key, or the resulting push interval
    /// is zero.
    pub fn resolve(
        json: Option<&str>,
        env: &HashMap<String, String>,
        options: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(json) = json.filter(|s| !s.trim().is_empty()) {
            config = config.apply(ConfigLayer::from_json(json)?);
        }

        if let Some(options) = options.filter(|s| !s.trim().is_empty()) {
            config = config.apply(ConfigLayer::from_options(options)?);
        }

        if !env.is_empty() {
            config = config.apply(ConfigLayer::from_env(env)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Merges a layer on top of this configuration.
    #[must_use]
    pub fn apply(mut self, layer: ConfigLayer) -> Self {
        if let Some(url) = layer.url {
            self.url = url;
        }
        if let Some(skip) = layer.insecure_skip_tls_verify {
            self.insecure_skip_tls_verify = skip;
        }
        if let Some(interval) = layer.push_interval {
            self.push_interval = interval;
        }
        if let Some(timeout) = layer.timeout {
            self.timeout = timeout;
        }
        if let Some(test_id) = layer.test_id {
            self.test_id = test_id;
        }
        if let Some(pod) = layer.pod {
            self.pod = pod;
        }
        if let Some(batch_size) = layer.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(interval) = layer.cleanup_interval {
            self.cleanup_interval = interval;
        }
        if let Some(age) = layer.max_series_age {
            self.max_series_age = age;
        }
        self.headers.extend(layer.headers);
        self
    }

    /// Builds the remote-write client configuration.
    pub fn remote_write_config(&self) -> RemoteWriteConfig {
        let mut remote = RemoteWriteConfig::new(self.url.clone())
            .with_timeout(self.timeout)
            .with_insecure_skip_tls_verify(self.insecure_skip_tls_verify);
        for (name, value) in &self.headers {
            remote = remote.with_header(name.clone(), value.clone());
        }
        remote
    }

    fn validate(&self) -> Result<()> {
        if self.push_interval.is_zero() {
            return Err(ConfigError::ZeroPushInterval.into());
        }
        Ok(())
    }
}

/// One partial configuration source.
///
/// Fields left as `None` (and absent headers) keep the value from lower
/// layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    /// Remote-write endpoint URL.
    pub url: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure_skip_tls_verify: Option<bool>,
    /// Interval between flushes.
    pub push_interval: Option<Duration>,
    /// HTTP timeout for a push.
    pub timeout: Option<Duration>,
    /// Test id label value.
    pub test_id: Option<String>,
    /// Pod label value.
    pub pod: Option<String>,
    /// Batch capacity hint.
    pub batch_size: Option<usize>,
    /// Minimum time between retention sweeps.
    pub cleanup_interval: Option<Duration>,
    /// Series eviction age.
    pub max_series_age: Option<Duration>,
    /// Headers to add or replace.
    pub headers: BTreeMap<String, String>,
}

/// JSON shape of a configuration layer.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonLayer {
    url: Option<String>,
    #[serde(rename = "insecureSkipTLSVerify")]
    insecure_skip_tls_verify: Option<bool>,
    push_interval: Option<JsonDuration>,
    timeout: Option<JsonDuration>,
    test_id: Option<String>,
    pod: Option<String>,
    batch_size: Option<usize>,
    cleanup_interval: Option<JsonDuration>,
    max_series_age: Option<JsonDuration>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// A duration in JSON: integer milliseconds or a human-readable string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonDuration {
    Millis(u64),
    Text(String),
}

impl JsonDuration {
    fn into_duration(self, key: &str) -> Result<Duration> {
        match self {
            Self::Millis(ms) => Ok(Duration::from_millis(ms)),
            Self::Text(text) => parse_duration(key, &text),
        }
    }
}

fn json_duration(value: Option<JsonDuration>, key: &str) -> Result<Option<Duration>> {
    value.map(|d| d.into_duration(key)).transpose()
}

impl ConfigLayer {
    /// Parses a JSON configuration document.
    ///
    /// Unrecognized keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed JSON or mistyped values,
    /// and [`ConfigError::InvalidDuration`] for unparseable durations.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: JsonLayer =
            serde_json::from_str(json).map_err(|e| ConfigError::Json { source: e })?;

        Ok(Self {
            url: raw.url,
            insecure_skip_tls_verify: raw.insecure_skip_tls_verify,
            push_interval: json_duration(raw.push_interval, "pushInterval")?,
            timeout: json_duration(raw.timeout, "timeout")?,
            test_id: raw.test_id,
            pod: raw.pod,
            batch_size: raw.batch_size,
            cleanup_interval: json_duration(raw.cleanup_interval, "cleanupInterval")?,
            max_series_age: json_duration(raw.max_series_age, "maxSeriesAge")?,
            headers: raw.headers,
        })
    }

    /// Reads the `SLUICE_*` variables from an environment map.
    ///
    /// Headers come from `SLUICE_HEADERS_<NAME>=value` variables and from
    /// `SLUICE_HEADERS=name:value,name:value`; the latter wins on conflict.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unparseable duration, integer or
    /// boolean, or a header pair that is not exactly `name:value`.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self> {
        let mut layer = Self::default();

        if let Some(url) = env.get(ENV_URL) {
            layer.url = Some(url.clone());
        }
        if let Some(value) = env.get(ENV_PUSH_INTERVAL) {
            layer.push_interval = Some(parse_duration(ENV_PUSH_INTERVAL, value)?);
        }
        if let Some(test_id) = env.get(ENV_TEST_ID) {
            layer.test_id = Some(test_id.clone());
        }
        if let Some(pod) = env.get(ENV_POD) {
            layer.pod = Some(pod.clone());
        }
        if let Some(value) = env.get(ENV_BATCH_SIZE) {
            layer.batch_size = Some(parse_integer(ENV_BATCH_SIZE, value)?);
        }
        if let Some(value) = env.get(ENV_INSECURE_SKIP_TLS_VERIFY) {
            layer.insecure_skip_tls_verify = Some(parse_bool(ENV_INSECURE_SKIP_TLS_VERIFY, value)?);
        }
        if let Some(value) = env.get(ENV_CLEANUP_INTERVAL) {
            layer.cleanup_interval = Some(parse_duration(ENV_CLEANUP_INTERVAL, value)?);
        }
        if let Some(value) = env.get(ENV_MAX_SERIES_AGE) {
            layer.max_series_age = Some(parse_duration(ENV_MAX_SERIES_AGE, value)?);
        }

        for (key, value) in env {
            if let Some(name) = key.strip_prefix(ENV_HEADER_PREFIX)
                && !name.is_empty()
            {
                layer.headers.insert(name.to_string(), value.clone());
            }
        }

        if let Some(headers) = env.get(ENV_HEADERS) {
            for pair in headers.split(',') {
                let parts: Vec<&str> = pair.split(':').collect();
                let [name, value] = parts.as_slice() else {
                    return Err(ConfigError::MalformedHeader {
                        pair: pair.to_string(),
                    }
                    .into());
                };
                layer
                    .headers
                    .insert((*name).to_string(), (*value).to_string());
            }
        }

        Ok(layer)
    }

    /// Parses an option string such as
    /// `url=http://vm:8428/api/v1/write,pushInterval=2s,headers.X-Token=abc`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedOption`] for an item without `=`,
    /// [`ConfigError::UnknownKey`] for an unrecognized key, and the usual
    /// value errors for malformed values.
    pub fn from_options(text: &str) -> Result<Self> {
        let mut layer = Self::default();

        for item in text.split(',') {
            let Some((key, value)) = item.split_once('=') else {
                return Err(ConfigError::MalformedOption {
                    item: item.to_string(),
                }
                .into());
            };

            match key {
                "url" => layer.url = Some(value.to_string()),
                "insecureSkipTLSVerify" => {
                    layer.insecure_skip_tls_verify = Some(parse_bool(key, value)?);
                }
                "pushInterval" => layer.push_interval = Some(parse_duration(key, value)?),
                "testId" => layer.test_id = Some(value.to_string()),
                "pod" => layer.pod = Some(value.to_string()),
                "batchSize" => layer.batch_size = Some(parse_integer(key, value)?),
                _ => {
                    let Some(name) = key.strip_prefix("headers.") else {
                        return Err(ConfigError::UnknownKey {
                            key: key.to_string(),
                        }
                        .into());
                    };
                    layer.headers.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(layer)
    }
}

/// Parses a human-readable duration (e.g. `5s`, `1m30s`, `250ms`).
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| {
        ConfigError::InvalidDuration {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn parse_integer(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidInteger {
            key: key.to_string(),
            value: value.to_string(),
        }
        .into()
    })
}

/// Accepts the same spellings as Go's `strconv.ParseBool`.
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }
        .into()),
    }
}

fn serialize_duration<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*duration))
}
