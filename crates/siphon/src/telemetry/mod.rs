//! OpenTelemetry metrics for the pipeline.
//!
//! When `telemetry.enabled` is set, an OTLP/gRPC exporter with a periodic
//! reader is installed as the global meter provider; otherwise instruments
//! bind to the default no-op provider and every `record_*` call is free.
//! Components receive a [`Metrics`] handle through their constructors —
//! there is no ambient singleton beyond the provider the SDK itself owns.
//!
//! The instrument set covers the pipeline end to end:
//!
//! - object side: processed/errored counts, bytes, per-file latency
//! - HTTP side: batches/lines/bytes sent, classified error counters,
//!   request latency, buffer utilization
//! - scanner side: scan errors and the processing-lag gauge
//!
//! Classified HTTP error counters always bump the umbrella `http_errors`
//! counter as well, so the umbrella stays the single alerting signal.

use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing::error;

use crate::config::TelemetryConfig;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}

/// Classification of a failed HTTP send, matched from the transport error
/// or response status by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Network,
    Server,
    Other,
}

/// Owns the meter provider so metrics can be flushed at shutdown.
pub struct Telemetry {
    provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Initializes the exporter according to config. With telemetry
    /// disabled this is a no-op and instruments stay no-op too.
    pub fn init(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
        if !config.enabled {
            return Ok(Telemetry { provider: None });
        }

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .build()?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(config.export_interval_secs))
            .build();

        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .build();

        let provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();

        global::set_meter_provider(provider.clone());

        Ok(Telemetry {
            provider: Some(provider),
        })
    }

    /// Flushes and shuts down the exporter. Failures are logged, not
    /// propagated; shutdown must proceed regardless.
    pub fn shutdown(&self) {
        if let Some(provider) = &self.provider {
            if let Err(e) = provider.shutdown() {
                error!("failed to shut down telemetry exporter: {e}");
            }
        }
    }
}

/// Instrument set shared by every pipeline component. Cloning is cheap;
/// each stage holds its own copy.
#[derive(Clone)]
pub struct Metrics {
    objects_processed: Counter<u64>,
    object_bytes: Counter<u64>,
    object_errors: Counter<u64>,
    processing_latency: Histogram<f64>,

    scan_errors: Counter<u64>,
    processing_lag: Gauge<f64>,

    http_batches_sent: Counter<u64>,
    http_lines_sent: Counter<u64>,
    http_bytes_sent: Counter<u64>,
    http_errors: Counter<u64>,
    http_network_errors: Counter<u64>,
    http_timeout_errors: Counter<u64>,
    http_server_errors: Counter<u64>,
    http_request_latency: Histogram<f64>,
    buffer_utilization: Gauge<f64>,
}

impl Metrics {
    /// Builds the instrument set against the global meter provider.
    #[must_use]
    pub fn new() -> Metrics {
        let meter = global::meter("siphon");

        Metrics {
            objects_processed: meter
                .u64_counter("objects_processed_total")
                .with_description("Objects successfully downloaded and forwarded")
                .with_unit("{object}")
                .build(),
            object_bytes: meter
                .u64_counter("object_bytes_processed_total")
                .with_description("Decompressed bytes forwarded from objects")
                .with_unit("By")
                .build(),
            object_errors: meter
                .u64_counter("object_errors_total")
                .with_description("Per-file processing failures")
                .with_unit("{error}")
                .build(),
            processing_latency: meter
                .f64_histogram("object_processing_latency_seconds")
                .with_description("Time to process a single object")
                .with_unit("s")
                .build(),
            scan_errors: meter
                .u64_counter("scan_errors_total")
                .with_description("Scan ticks aborted by a listing failure")
                .with_unit("{error}")
                .build(),
            processing_lag: meter
                .f64_gauge("processing_lag_seconds")
                .with_description("Gap between now and the watermark timestamp")
                .with_unit("s")
                .build(),
            http_batches_sent: meter
                .u64_counter("http_batches_sent_total")
                .with_description("Batches delivered to an ingestion endpoint")
                .with_unit("{batch}")
                .build(),
            http_lines_sent: meter
                .u64_counter("http_lines_sent_total")
                .with_description("Log lines delivered over HTTP")
                .with_unit("{line}")
                .build(),
            http_bytes_sent: meter
                .u64_counter("http_bytes_sent_total")
                .with_description("Body bytes delivered over HTTP")
                .with_unit("By")
                .build(),
            http_errors: meter
                .u64_counter("http_errors_total")
                .with_description("Failed batch sends, any cause")
                .with_unit("{error}")
                .build(),
            http_network_errors: meter
                .u64_counter("http_network_errors_total")
                .with_description("Failed batch sends: connection-level failures")
                .with_unit("{error}")
                .build(),
            http_timeout_errors: meter
                .u64_counter("http_timeout_errors_total")
                .with_description("Failed batch sends: timeouts")
                .with_unit("{error}")
                .build(),
            http_server_errors: meter
                .u64_counter("http_server_errors_total")
                .with_description("Failed batch sends: HTTP 5xx responses")
                .with_unit("{error}")
                .build(),
            http_request_latency: meter
                .f64_histogram("http_request_duration_seconds")
                .with_description("HTTP request latency")
                .with_unit("s")
                .build(),
            buffer_utilization: meter
                .f64_gauge("buffer_utilization_ratio")
                .with_description("Line-buffer fill level, 0.0 to 1.0")
                .with_unit("{ratio}")
                .build(),
        }
    }

    pub fn record_object_processed(&self, bytes: u64, latency: Duration) {
        self.objects_processed.add(1, &[]);
        self.object_bytes.add(bytes, &[]);
        self.processing_latency.record(latency.as_secs_f64(), &[]);
    }

    pub fn record_object_error(&self) {
        self.object_errors.add(1, &[]);
    }

    pub fn record_scan_error(&self) {
        self.scan_errors.add(1, &[]);
    }

    pub fn update_processing_lag(&self, lag_seconds: f64) {
        self.processing_lag
            .record(lag_seconds, &[KeyValue::new("component", "scanner")]);
    }

    pub fn record_http_batch(&self, lines: u64, bytes: u64) {
        self.http_batches_sent.add(1, &[]);
        self.http_lines_sent.add(lines, &[]);
        self.http_bytes_sent.add(bytes, &[]);
    }

    /// Increments the counter for the given error class plus the umbrella
    /// error counter.
    pub fn record_http_error(&self, kind: HttpErrorKind) {
        self.http_errors.add(1, &[]);
        match kind {
            HttpErrorKind::Timeout => self.http_timeout_errors.add(1, &[]),
            HttpErrorKind::Network => self.http_network_errors.add(1, &[]),
            HttpErrorKind::Server => self.http_server_errors.add(1, &[]),
            HttpErrorKind::Other => {}
        }
    }

    pub fn record_http_request_latency(&self, seconds: f64) {
        self.http_request_latency
            .record(seconds, &[KeyValue::new("component", "http_sender")]);
    }

    pub fn update_buffer_utilization(&self, ratio: f64) {
        self.buffer_utilization
            .record(ratio, &[KeyValue::new("component", "http_sender")]);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_telemetry_is_noop() {
        let config = TelemetryConfig::default();
        let telemetry = Telemetry::init(&config).unwrap();
        // No provider installed; instruments bind to the no-op meter and
        // recording must not panic.
        let metrics = Metrics::new();
        metrics.record_object_processed(128, Duration::from_millis(5));
        metrics.record_object_error();
        metrics.record_scan_error();
        metrics.record_http_batch(10, 1024);
        metrics.record_http_error(HttpErrorKind::Server);
        metrics.record_http_error(HttpErrorKind::Other);
        metrics.update_buffer_utilization(0.4);
        metrics.update_processing_lag(12.0);
        telemetry.shutdown();
    }
}
