//! Download worker pool.
//!
//! N stateless workers drain one bounded job queue. Per job: fetch the
//! object (5-minute deadline), verify the gzip magic, decompress, split
//! into lines capped at 1 MiB, run each line through the active format's
//! filter, and forward survivors into the line buffer with an awaiting
//! send — when the HTTP side stalls, downloads stall with it.
//!
//! A successful job advances the watermark with its timestamp, key, and
//! forwarded byte count. A failed job increments the file-error counter
//! and leaves the watermark alone; the object stays eligible for a later
//! scan. Failures never cross job boundaries.

use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::read::GzDecoder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::formats::LogFormat;
use crate::pipeline::LogLine;
use crate::scanner::FileJob;
use crate::state::StateStore;
use crate::telemetry::Metrics;

/// Per-job wall-clock budget, fetch through forward.
const JOB_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Longest accepted line, decompressed, excluding the newline.
const MAX_LINE_BYTES: usize = 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to fetch object: {0}")]
    Fetch(#[from] object_store::Error),

    #[error("object is not gzip-compressed (bad magic bytes)")]
    NotGzip,

    #[error("failed to decompress object: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("line exceeds the {MAX_LINE_BYTES}-byte limit")]
    LineTooLong,

    #[error("job exceeded the {}s deadline", JOB_DEADLINE.as_secs())]
    DeadlineExceeded,

    #[error("line buffer closed while the pool was still running")]
    BufferClosed,
}

struct WorkerContext {
    store: Arc<dyn ObjectStore>,
    state: Arc<StateStore>,
    format: Arc<dyn LogFormat>,
    line_tx: async_channel::Sender<LogLine>,
    metrics: Metrics,
    files_processed: Arc<AtomicI64>,
    bytes_processed: Arc<AtomicI64>,
    errors: Arc<AtomicI64>,
}

/// Handle to the running pool: submit jobs, observe counters, shut down.
pub struct DownloadPool {
    job_tx: async_channel::Sender<FileJob>,
    // Held so the queue closes on `shutdown`, not when the last worker
    // drops its receiver.
    _job_rx: async_channel::Receiver<FileJob>,
    handles: Vec<JoinHandle<()>>,
    files_processed: Arc<AtomicI64>,
    bytes_processed: Arc<AtomicI64>,
    errors: Arc<AtomicI64>,
}

impl DownloadPool {
    /// Spawns `worker_count` workers over a job queue of `queue_size`.
    ///
    /// `line_tx` is cloned into the workers and dropped here, so the line
    /// buffer closes exactly when the last worker returns.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        state: Arc<StateStore>,
        format: Arc<dyn LogFormat>,
        metrics: Metrics,
        worker_count: usize,
        queue_size: usize,
        line_tx: async_channel::Sender<LogLine>,
    ) -> DownloadPool {
        let (job_tx, job_rx) = async_channel::bounded(queue_size);

        let files_processed = Arc::new(AtomicI64::new(0));
        let bytes_processed = Arc::new(AtomicI64::new(0));
        let errors = Arc::new(AtomicI64::new(0));

        let handles = (0..worker_count)
            .map(|id| {
                let ctx = WorkerContext {
                    store: Arc::clone(&store),
                    state: Arc::clone(&state),
                    format: Arc::clone(&format),
                    line_tx: line_tx.clone(),
                    metrics: metrics.clone(),
                    files_processed: Arc::clone(&files_processed),
                    bytes_processed: Arc::clone(&bytes_processed),
                    errors: Arc::clone(&errors),
                };
                let job_rx = job_rx.clone();
                tokio::spawn(worker_loop(id, job_rx, ctx))
            })
            .collect();

        DownloadPool {
            job_tx,
            _job_rx: job_rx,
            handles,
            files_processed,
            bytes_processed,
            errors,
        }
    }

    /// Attempts to enqueue a job without blocking. `false` means the
    /// queue is full (or the pool is shutting down); the caller defers
    /// the rest of its tick and the object is rediscovered next scan.
    pub fn submit(&self, job: FileJob) -> bool {
        self.job_tx.try_send(job).is_ok()
    }

    /// Current depth of the job queue.
    pub fn queue_len(&self) -> usize {
        self.job_tx.len()
    }

    /// Closes the job queue and waits for every worker to finish,
    /// including jobs still in flight and jobs already queued.
    pub async fn shutdown(&mut self) {
        self.job_tx.close();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("download worker panicked: {e}");
            }
        }
    }

    pub fn files_processed(&self) -> i64 {
        self.files_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> i64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> i64 {
        self.errors.load(Ordering::Relaxed)
    }
}

async fn worker_loop(id: usize, job_rx: async_channel::Receiver<FileJob>, ctx: WorkerContext) {
    while let Ok(job) = job_rx.recv().await {
        let started = Instant::now();
        match process_job(&ctx, &job).await {
            Ok(forwarded) => {
                ctx.state.update(job.timestamp, &job.key, forwarded.bytes);
                ctx.files_processed.fetch_add(1, Ordering::Relaxed);
                ctx.bytes_processed.fetch_add(forwarded.bytes, Ordering::Relaxed);
                ctx.metrics
                    .record_object_processed(forwarded.bytes as u64, started.elapsed());
                info!(
                    worker_id = id,
                    key = %job.key,
                    lines = forwarded.lines,
                    bytes = forwarded.bytes,
                    "processed object"
                );
            }
            Err(DownloadError::BufferClosed) => {
                // Shutdown contract violation; nothing downstream will
                // consume, so stop this worker.
                error!(worker_id = id, key = %job.key, "line buffer closed mid-job");
                ctx.errors.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.record_object_error();
                return;
            }
            Err(e) => {
                error!(worker_id = id, key = %job.key, "failed to process object: {e}");
                ctx.errors.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.record_object_error();
            }
        }
    }
    debug!(worker_id = id, "download worker exiting");
}

struct Forwarded {
    lines: i64,
    bytes: i64,
}

async fn process_job(ctx: &WorkerContext, job: &FileJob) -> Result<Forwarded, DownloadError> {
    tokio::time::timeout(JOB_DEADLINE, fetch_and_forward(ctx, job))
        .await
        .map_err(|_| DownloadError::DeadlineExceeded)?
}

async fn fetch_and_forward(ctx: &WorkerContext, job: &FileJob) -> Result<Forwarded, DownloadError> {
    let path = ObjectPath::from(job.key.as_str());
    let body = ctx.store.get(&path).await?.bytes().await?;

    if body.len() < GZIP_MAGIC.len() || body[..2] != GZIP_MAGIC {
        return Err(DownloadError::NotGzip);
    }

    let mut reader = BufReader::new(GzDecoder::new(body.as_ref()));
    let mut buf = Vec::new();
    let mut is_first_line = true;
    let mut forwarded = Forwarded { lines: 0, bytes: 0 };

    loop {
        buf.clear();
        // Bound the read so a newline-free stream cannot grow the buffer
        // past the line limit.
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
        let n = limited.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.len() > MAX_LINE_BYTES && !buf.ends_with(b"\n") {
            return Err(DownloadError::LineTooLong);
        }

        let mut line: &[u8] = &buf;
        if line.ends_with(b"\n") {
            line = &line[..line.len() - 1];
        }
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }

        if let Some(kept) = ctx.format.filter_line(line, is_first_line) {
            let owned = Bytes::copy_from_slice(kept);
            forwarded.lines += 1;
            forwarded.bytes += owned.len() as i64;
            if ctx.line_tx.send(owned).await.is_err() {
                return Err(DownloadError::BufferClosed);
            }
        }
        is_first_line = false;
    }

    Ok(forwarded)
}
