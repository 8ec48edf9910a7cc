//! Batch aggregation and HTTP fan-out.
//!
//! One aggregator task drains the line buffer into a current batch and
//! flushes it to the batch queue when any trigger fires:
//!
//! | trigger   | condition                                            |
//! |-----------|------------------------------------------------------|
//! | count     | lines in batch ≥ `batch_lines`                       |
//! | bytes     | cumulative bytes (each line `len + 1`) ≥ `batch_bytes` |
//! | time      | `flush_interval` since the last flush                |
//! | shutdown  | line buffer closed                                   |
//!
//! A line that crosses a bound is included first, then the batch flushes,
//! so a batch can overshoot `batch_bytes` by at most one line. Timer
//! ticks never emit empty batches. The aggregator also samples the line
//! buffer's depth every five seconds for the utilization gauge.
//!
//! M sender tasks drain the batch queue; task *i* always posts to
//! `endpoints[i mod E]`. Batches are newline-joined with a trailing
//! newline and posted with the active format's Content-Type. Any 2xx is
//! success. A failed batch is classified (timeout / network / 5xx /
//! other), logged, counted, and dropped — recovery happens at scan
//! granularity through the watermark, and retrying here would wedge the
//! backpressure chain and reorder ingestion.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::HttpConfig;
use crate::pipeline::LogLine;
use crate::telemetry::{HttpErrorKind, Metrics};

/// How long to wait for a TCP connect.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the buffer-utilization gauge sample.
const BUFFER_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),

    #[error("failed to send request: {0}")]
    Request(reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// A bounded collection of lines shipped as one request body.
#[derive(Debug, Default)]
pub struct Batch {
    pub lines: Vec<LogLine>,
    /// Cumulative size: every line counts its length plus one newline.
    pub size: usize,
}

impl Batch {
    fn with_capacity(lines: usize) -> Batch {
        // Cap the pre-allocation; batch_lines is a trigger, not a promise.
        Batch {
            lines: Vec::with_capacity(lines.min(1024)),
            size: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Running aggregator + sender stage.
pub struct HttpSender {
    handles: Vec<JoinHandle<()>>,
    sent_batches: Arc<AtomicI64>,
    sent_lines: Arc<AtomicI64>,
    sent_bytes: Arc<AtomicI64>,
    errors: Arc<AtomicI64>,
}

impl HttpSender {
    /// Spawns the aggregator and `workers` sender tasks.
    ///
    /// The aggregator owns the only batch-queue sender; when the line
    /// buffer closes and the final partial batch is flushed, the batch
    /// queue closes behind it and the senders drain out.
    pub fn start(
        config: &HttpConfig,
        content_type: String,
        line_rx: async_channel::Receiver<LogLine>,
        flush_interval: Duration,
        metrics: Metrics,
    ) -> Result<HttpSender, SendError> {
        let client = build_client(config)?;
        let (batch_tx, batch_rx) = async_channel::bounded(config.workers * 2);

        let sent_batches = Arc::new(AtomicI64::new(0));
        let sent_lines = Arc::new(AtomicI64::new(0));
        let sent_bytes = Arc::new(AtomicI64::new(0));
        let errors = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::with_capacity(config.workers + 1);
        handles.push(tokio::spawn(aggregator_loop(
            line_rx,
            batch_tx,
            config.batch_lines,
            config.batch_bytes,
            flush_interval,
            config.buffer_size,
            metrics.clone(),
        )));

        for i in 0..config.workers {
            let endpoint = config.endpoints[i % config.endpoints.len()].clone();
            let ctx = SenderContext {
                client: client.clone(),
                endpoint,
                content_type: content_type.clone(),
                metrics: metrics.clone(),
                sent_batches: Arc::clone(&sent_batches),
                sent_lines: Arc::clone(&sent_lines),
                sent_bytes: Arc::clone(&sent_bytes),
                errors: Arc::clone(&errors),
            };
            handles.push(tokio::spawn(sender_loop(i, batch_rx.clone(), ctx)));
        }

        Ok(HttpSender {
            handles,
            sent_batches,
            sent_lines,
            sent_bytes,
            errors,
        })
    }

    /// Waits for the aggregator and all senders to finish. Call after the
    /// line buffer has closed.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("sender task panicked: {e}");
            }
        }
    }

    pub fn sent_batches(&self) -> i64 {
        self.sent_batches.load(Ordering::Relaxed)
    }

    pub fn sent_lines(&self) -> i64 {
        self.sent_lines.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> i64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> i64 {
        self.errors.load(Ordering::Relaxed)
    }
}

fn build_client(config: &HttpConfig) -> Result<reqwest::Client, SendError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(DIAL_TIMEOUT)
        .pool_max_idle_per_host(config.max_idle_conns)
        .pool_idle_timeout(Duration::from_secs(config.idle_conn_timeout_secs))
        .build()
        .map_err(SendError::Client)
}

async fn aggregator_loop(
    line_rx: async_channel::Receiver<LogLine>,
    batch_tx: async_channel::Sender<Batch>,
    batch_lines: usize,
    batch_bytes: usize,
    flush_interval: Duration,
    buffer_size: usize,
    metrics: Metrics,
) {
    let mut batch = Batch::with_capacity(batch_lines);

    let mut flush_ticker = tokio::time::interval(flush_interval);
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut monitor_ticker = tokio::time::interval(BUFFER_MONITOR_INTERVAL);
    monitor_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Both tickers fire immediately on creation; swallow that.
    flush_ticker.tick().await;
    monitor_ticker.tick().await;

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                match line {
                    Ok(line) => {
                        batch.size += line.len() + 1;
                        batch.lines.push(line);
                        if batch.lines.len() >= batch_lines || batch.size >= batch_bytes {
                            if !flush(&mut batch, &batch_tx, batch_lines).await {
                                return;
                            }
                        }
                    }
                    Err(_) => {
                        // Line buffer closed: every download worker has
                        // returned. Emit the partial batch and stop.
                        flush(&mut batch, &batch_tx, batch_lines).await;
                        debug!("aggregator exiting, line buffer closed");
                        return;
                    }
                }
            }
            _ = flush_ticker.tick() => {
                if !flush(&mut batch, &batch_tx, batch_lines).await {
                    return;
                }
            }
            _ = monitor_ticker.tick() => {
                let ratio = line_rx.len() as f64 / buffer_size as f64;
                metrics.update_buffer_utilization(ratio);
            }
        }
    }
}

/// Sends the current batch (if non-empty) and resets it. Returns `false`
/// when the batch queue is closed and the aggregator should stop.
async fn flush(
    batch: &mut Batch,
    batch_tx: &async_channel::Sender<Batch>,
    batch_lines: usize,
) -> bool {
    if batch.is_empty() {
        return true;
    }
    let full = std::mem::replace(batch, Batch::with_capacity(batch_lines));
    batch_tx.send(full).await.is_ok()
}

struct SenderContext {
    client: reqwest::Client,
    endpoint: String,
    content_type: String,
    metrics: Metrics,
    sent_batches: Arc<AtomicI64>,
    sent_lines: Arc<AtomicI64>,
    sent_bytes: Arc<AtomicI64>,
    errors: Arc<AtomicI64>,
}

async fn sender_loop(id: usize, batch_rx: async_channel::Receiver<Batch>, ctx: SenderContext) {
    while let Ok(batch) = batch_rx.recv().await {
        let lines = batch.lines.len() as i64;
        let size = batch.size as i64;

        match send_batch(&ctx, &batch).await {
            Ok(()) => {
                ctx.sent_batches.fetch_add(1, Ordering::Relaxed);
                ctx.sent_lines.fetch_add(lines, Ordering::Relaxed);
                ctx.sent_bytes.fetch_add(size, Ordering::Relaxed);
                ctx.metrics.record_http_batch(lines as u64, size as u64);
            }
            Err(e) => {
                // The batch is dropped; the lines surface again only if
                // the watermark re-admits their object.
                error!(
                    worker_id = id,
                    endpoint = %ctx.endpoint,
                    batch_lines = lines,
                    "failed to send batch: {e}"
                );
                ctx.errors.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.record_http_error(classify(&e));
            }
        }
    }
    debug!(worker_id = id, "http sender exiting");
}

async fn send_batch(ctx: &SenderContext, batch: &Batch) -> Result<(), SendError> {
    let mut body = Vec::with_capacity(batch.size);
    for line in &batch.lines {
        body.extend_from_slice(line);
        body.push(b'\n');
    }

    let started = Instant::now();
    let result = ctx
        .client
        .post(&ctx.endpoint)
        .header(CONTENT_TYPE, ctx.content_type.as_str())
        .body(body)
        .send()
        .await;
    ctx.metrics
        .record_http_request_latency(started.elapsed().as_secs_f64());

    let response = result.map_err(SendError::Request)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SendError::Status { status, body });
    }
    Ok(())
}

fn classify(error: &SendError) -> HttpErrorKind {
    match error {
        SendError::Request(e) | SendError::Client(e) => {
            if e.is_timeout() {
                HttpErrorKind::Timeout
            } else if e.is_connect() {
                HttpErrorKind::Network
            } else {
                HttpErrorKind::Other
            }
        }
        SendError::Status { status, .. } => {
            if status.is_server_error() {
                HttpErrorKind::Server
            } else {
                HttpErrorKind::Other
            }
        }
    }
}
