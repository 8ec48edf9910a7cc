//! Runtime configuration for the siphon daemon.
//!
//! Configuration is loaded from a single YAML file whose path is given on
//! the command line. Every section has sensible defaults; [`Config::validate`]
//! collects all problems into one error so an operator sees the full list on
//! a failed start instead of fixing them one at a time.
//!
//! Durations are expressed as plain integers (seconds, or milliseconds where
//! noted) to keep the file format free of unit-string parsing.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 10 MiB hard ceiling for a single HTTP batch body.
pub const MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound on the line-buffer capacity.
pub const MAX_BUFFER_SIZE: usize = 100_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration validation failed:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

/// A user-defined log format, compiled into a generic descriptor at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    /// Format name referenced by `processing.default_format`.
    pub name: String,
    /// Glob matched against object basenames during auto-detection.
    pub filename_pattern: String,
    /// Regex with exactly one capture group that isolates the timestamp.
    pub timestamp_regex: String,
    /// `unix`, `unix_ms`, or a chrono format string.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    /// HTTP Content-Type used when dispatching lines of this format.
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Number of leading lines dropped from every file.
    #[serde(default)]
    pub skip_header_lines: usize,
    /// Field separator for CSV-like formats.
    #[serde(default = "default_field_separator")]
    pub field_separator: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct S3Config {
    /// Bucket name; a leading `s3://` is tolerated and stripped.
    pub bucket: String,
    /// Key prefix under which date partitions live.
    pub prefix: String,
    /// Region, used for startup validation; credentials and region are
    /// resolved from the environment by the object-store client.
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Ingestion endpoints; sender workers round-robin over this list.
    pub endpoints: Vec<String>,
    /// Max lines per batch.
    pub batch_lines: usize,
    /// Max bytes per batch (each line counts its length plus one newline).
    pub batch_bytes: usize,
    /// Force a flush after this many milliseconds even if the batch is not full.
    pub flush_interval_ms: u64,
    /// Number of parallel HTTP sender tasks.
    pub workers: usize,
    /// Capacity of the line buffer between downloaders and the aggregator.
    pub buffer_size: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Idle connections kept per endpoint host.
    pub max_idle_conns: usize,
    /// How long an idle connection may live before it is reaped.
    pub idle_conn_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            endpoints: Vec::new(),
            batch_lines: 1000,
            batch_bytes: 1024 * 1024,
            flush_interval_ms: 1000,
            workers: 10,
            buffer_size: 10_000,
            timeout_secs: 30,
            max_idle_conns: 100,
            idle_conn_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of parallel download workers.
    pub worker_count: usize,
    /// Capacity of the file-job queue feeding the download workers.
    pub queue_size: usize,
    /// Seconds between scan ticks.
    pub scan_interval_secs: u64,
    /// Minimum object age before it becomes eligible for processing.
    pub delay_window_secs: u64,
    /// User-defined formats, registered ahead of the built-ins.
    pub log_formats: Vec<FormatConfig>,
    /// Active format name, or `auto` for detection.
    pub default_format: String,
    /// Legacy single-format field; treated as `default_format` when set.
    pub log_format: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            worker_count: 4,
            queue_size: 1000,
            scan_interval_secs: 10,
            delay_window_secs: 60,
            log_formats: Vec::new(),
            default_format: String::new(),
            log_format: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub database: i64,
    /// Prefix for the state key (`<prefix>:state`).
    pub key_prefix: String,
}

impl RedisConfig {
    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.database
            )
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path of the local watermark file.
    pub file_path: String,
    /// Seconds between periodic watermark flushes.
    pub save_interval_secs: u64,
    pub redis: RedisConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            file_path: "siphon-state.json".to_string(),
            save_interval_secs: 10,
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.
    pub endpoint: String,
    pub export_interval_secs: u64,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enabled: false,
            endpoint: String::new(),
            export_interval_secs: 10,
            service_name: "siphon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub s3: S3Config,
    pub http: HttpConfig,
    pub processing: ProcessingConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Reads and parses the configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Checks required fields and value ranges, collecting every failure.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();

        if self.s3.bucket.is_empty() {
            errs.push("s3.bucket is required".to_string());
        }
        if self.s3.region.is_empty() {
            errs.push("s3.region is required".to_string());
        }

        if self.http.endpoints.is_empty() {
            errs.push("http.endpoints must contain at least one endpoint".to_string());
        }
        for (i, endpoint) in self.http.endpoints.iter().enumerate() {
            if endpoint.is_empty() {
                errs.push(format!("http.endpoints[{i}] cannot be empty"));
            } else if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                errs.push(format!("http.endpoints[{i}] must use http or https scheme"));
            }
        }

        if self.http.batch_lines == 0 {
            errs.push("http.batch_lines must be greater than 0".to_string());
        }
        if self.http.batch_bytes == 0 {
            errs.push("http.batch_bytes must be greater than 0".to_string());
        }
        if self.http.batch_bytes > MAX_BATCH_BYTES {
            errs.push("http.batch_bytes cannot exceed 10MiB".to_string());
        }
        if self.http.buffer_size == 0 {
            errs.push("http.buffer_size must be greater than 0".to_string());
        }
        if self.http.buffer_size > MAX_BUFFER_SIZE {
            errs.push("http.buffer_size cannot exceed 100,000".to_string());
        }
        if self.http.workers == 0 {
            errs.push("http.workers must be greater than 0".to_string());
        }
        if self.http.flush_interval_ms == 0 {
            errs.push("http.flush_interval_ms must be greater than 0".to_string());
        }

        if self.processing.worker_count == 0 {
            errs.push("processing.worker_count must be greater than 0".to_string());
        }
        if self.processing.queue_size == 0 {
            errs.push("processing.queue_size must be greater than 0".to_string());
        }
        if self.processing.scan_interval_secs == 0 {
            errs.push("processing.scan_interval_secs must be greater than 0".to_string());
        }
        if self.processing.delay_window_secs == 0 {
            errs.push("processing.delay_window_secs must be greater than 0".to_string());
        }

        for (i, format) in self.processing.log_formats.iter().enumerate() {
            if format.name.is_empty() {
                errs.push(format!("processing.log_formats[{i}].name is required"));
            }
            if format.filename_pattern.is_empty() {
                errs.push(format!(
                    "processing.log_formats[{i}].filename_pattern is required"
                ));
            }
            if format.timestamp_regex.is_empty() {
                errs.push(format!(
                    "processing.log_formats[{i}].timestamp_regex is required"
                ));
            }
        }

        // Legacy single-format field doubles as the default format name.
        if self.processing.default_format.is_empty() {
            if !self.processing.log_format.is_empty() {
                self.processing.default_format = self.processing.log_format.clone();
            } else if self.processing.log_formats.is_empty() {
                self.processing.default_format = "zscaler".to_string();
            } else {
                self.processing.default_format = "auto".to_string();
            }
        }

        if self.state.redis.enabled {
            if self.state.redis.host.is_empty() {
                self.state.redis.host = "localhost".to_string();
            }
            if self.state.redis.port == 0 {
                self.state.redis.port = 6379;
            }
            if self.state.redis.key_prefix.is_empty() {
                self.state.redis.key_prefix = "siphon".to_string();
            }
            if !(0..=15).contains(&self.state.redis.database) {
                errs.push("state.redis.database must be between 0 and 15".to_string());
            }
        }

        if self.telemetry.enabled {
            if self.telemetry.endpoint.is_empty() {
                errs.push("telemetry.endpoint is required when telemetry.enabled is true".to_string());
            }
            if self.telemetry.export_interval_secs == 0 {
                errs.push("telemetry.export_interval_secs must be greater than 0".to_string());
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" => {}
            _ => errs.push("logging.level must be one of: debug, info, warn, error".to_string()),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errs.push("logging.format must be one of: json, text".to_string()),
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errs))
        }
    }

    /// Bucket name with any `s3://` scheme stripped.
    pub fn bucket(&self) -> &str {
        self.s3.bucket.strip_prefix("s3://").unwrap_or(&self.s3.bucket)
    }

    /// Key prefix without a leading slash, trailing slash guaranteed when
    /// non-empty.
    pub fn key_prefix(&self) -> String {
        let p = self.s3.prefix.trim_start_matches('/');
        if p.is_empty() || p.ends_with('/') {
            p.to_string()
        } else {
            format!("{p}/")
        }
    }

    pub fn delay_window(&self) -> Duration {
        Duration::from_secs(self.processing.delay_window_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.processing.scan_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.http.flush_interval_ms)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.state.save_interval_secs)
    }
}

fn default_timestamp_format() -> String {
    "unix".to_string()
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

fn default_field_separator() -> String {
    ",".to_string()
}
