use std::str::FromStr;
use std::time::Duration;

use threatlens_core::queue::DEFAULT_LOCK_DURATION;
use threatlens_detectors::secondary::DEFAULT_CONFIDENCE;
use threatlens_pipeline::DetectionSettings;

/// A configuration variable that is set but cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{name} must be {expected}, got '{value}'")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Worker pool and capability client configuration.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of analyses processed concurrently (default: `2`).
    pub concurrency: usize,
    /// How often the queue is polled (default: `1000` ms).
    pub poll_interval: Duration,
    /// How long a claimed job may run before another claim may take it
    /// over (default: `300000` ms).
    pub lock_duration: Duration,
    /// Object-detection service base URL.
    pub secondary_url: String,
    pub secondary_probe_timeout: Duration,
    pub secondary_detect_timeout: Duration,
    /// Confidence threshold sent with predict calls (default: `0.05`).
    pub secondary_confidence: f64,
    /// Vision-language service base URL.
    pub vision_url: String,
    pub vision_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(1000),
            lock_duration: DEFAULT_LOCK_DURATION,
            secondary_url: "http://localhost:8000".into(),
            secondary_probe_timeout: Duration::from_millis(5000),
            secondary_detect_timeout: Duration::from_millis(30_000),
            secondary_confidence: DEFAULT_CONFIDENCE,
            vision_url: "http://localhost:8100".into(),
            vision_timeout: Duration::from_millis(120_000),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `WORKER_CONCURRENCY`          | `2`                     |
    /// | `QUEUE_POLL_INTERVAL_MS`      | `1000`                  |
    /// | `QUEUE_LOCK_DURATION_MS`      | `300000`                |
    /// | `SECONDARY_DETECTOR_URL`      | `http://localhost:8000` |
    /// | `SECONDARY_PROBE_TIMEOUT_MS`  | `5000`                  |
    /// | `SECONDARY_DETECT_TIMEOUT_MS` | `30000`                 |
    /// | `SECONDARY_CONFIDENCE`        | `0.05`                  |
    /// | `VISION_SERVICE_URL`          | `http://localhost:8100` |
    /// | `VISION_TIMEOUT_MS`           | `120000`                |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let concurrency: usize = parse_var(&lookup, "WORKER_CONCURRENCY", "a positive integer")?
            .unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(ConfigError {
                name: "WORKER_CONCURRENCY",
                value: "0".into(),
                expected: "a positive integer",
            });
        }

        let confidence: f64 = parse_var(&lookup, "SECONDARY_CONFIDENCE", "a number in [0, 1]")?
            .unwrap_or(defaults.secondary_confidence);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ConfigError {
                name: "SECONDARY_CONFIDENCE",
                value: confidence.to_string(),
                expected: "a number in [0, 1]",
            });
        }

        Ok(Self {
            concurrency,
            poll_interval: millis_var(&lookup, "QUEUE_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            lock_duration: millis_var(&lookup, "QUEUE_LOCK_DURATION_MS")?
                .unwrap_or(defaults.lock_duration),
            secondary_url: lookup("SECONDARY_DETECTOR_URL").unwrap_or(defaults.secondary_url),
            secondary_probe_timeout: millis_var(&lookup, "SECONDARY_PROBE_TIMEOUT_MS")?
                .unwrap_or(defaults.secondary_probe_timeout),
            secondary_detect_timeout: millis_var(&lookup, "SECONDARY_DETECT_TIMEOUT_MS")?
                .unwrap_or(defaults.secondary_detect_timeout),
            secondary_confidence: confidence,
            vision_url: lookup("VISION_SERVICE_URL").unwrap_or(defaults.vision_url),
            vision_timeout: millis_var(&lookup, "VISION_TIMEOUT_MS")?
                .unwrap_or(defaults.vision_timeout),
        })
    }

    pub fn detection_settings(&self) -> DetectionSettings {
        DetectionSettings {
            probe_timeout: self.secondary_probe_timeout,
            detect_timeout: self.secondary_detect_timeout,
            confidence: self.secondary_confidence,
        }
    }
}

/// Parse variable `name` from `lookup`; `None` when unset.
pub fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError {
            name,
            value: raw,
            expected,
        }),
    }
}

/// Parse variable `name` as a millisecond duration.
pub fn millis_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(lookup, name, "a duration in milliseconds")?.map(Duration::from_millis))
}
