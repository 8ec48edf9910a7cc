//! Process lifecycle: construction order, scan ticks, shutdown.
//!
//! The supervisor owns everything: it builds the telemetry exporter, the
//! watermark store, the format registry, the object-store client, and the
//! pipeline stages, handing each component its dependencies through
//! constructors — no ambient singletons. Startup brings the stages up
//! sink-first (senders, aggregator, download workers, state flusher, scan
//! ticker) so nothing produces into a stage that is not yet consuming.
//!
//! Shutdown runs the same order in reverse, driven by one cancellation
//! token armed by SIGINT/SIGTERM:
//!
//! 1. the scan ticker stops;
//! 2. the job queue closes and download workers finish in-flight and
//!    queued jobs, which drops the last line-buffer sender;
//! 3. the aggregator drains the buffer, flushes its partial batch and
//!    exits, closing the batch queue;
//! 4. senders drain the batch queue and exit;
//! 5. one final watermark flush captures updates made while draining;
//! 6. telemetry flushes.
//!
//! In-flight work is never abandoned mid-shutdown; the per-job deadline
//! and per-request timeouts bound how long draining can take.

use std::sync::Arc;

use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::formats::{FormatError, LogFormat, Registry};
use crate::pipeline::download::DownloadPool;
use crate::pipeline::sender::{HttpSender, SendError};
use crate::scanner::{ActiveFormat, Scanner};
use crate::state::file::FileBackend;
use crate::state::redis::RedisBackend;
use crate::state::{StateBackend, StateError, StateStore};
use crate::telemetry::{Metrics, Telemetry, TelemetryError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("failed to build object store client: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("--migrate-state requires state.redis.enabled")]
    MigrateWithoutRedis,
}

/// Runs the daemon until a termination signal arrives.
pub async fn run(config: Config) -> Result<(), SupervisorError> {
    let store: Arc<dyn ObjectStore> = Arc::new(
        AmazonS3Builder::from_env()
            .with_bucket_name(config.bucket())
            .build()?,
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    run_with_store(config, store, cancel).await
}

/// Runs the pipeline against an injected object store. Separated from
/// [`run`] so tests can drive the whole lifecycle in memory.
pub async fn run_with_store(
    config: Config,
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
) -> Result<(), SupervisorError> {
    let telemetry = Telemetry::init(&config.telemetry)?;
    let metrics = Metrics::new();

    let state = Arc::new(StateStore::open(select_state_backend(&config).await).await?);

    let registry = Arc::new(Registry::from_config(
        &config.processing.log_formats,
        &config.processing.default_format,
    )?);
    let auto_mode = config.processing.default_format == "auto";
    // One descriptor governs filtering and the Content-Type for the whole
    // pipeline; in auto mode that is the registry default, while the
    // scanner detects per key.
    let active: Arc<dyn LogFormat> = if auto_mode {
        registry.default_format()
    } else {
        registry.get(&config.processing.default_format)?
    };
    let scanner_format = if auto_mode {
        ActiveFormat::Auto(Arc::clone(&registry))
    } else {
        ActiveFormat::Pinned(Arc::clone(&active))
    };

    let scanner = Scanner::new(
        Arc::clone(&store),
        config.key_prefix(),
        config.delay_window(),
        scanner_format,
    );

    let (line_tx, line_rx) = async_channel::bounded(config.http.buffer_size);

    let mut sender = HttpSender::start(
        &config.http,
        active.content_type().to_string(),
        line_rx,
        config.flush_interval(),
        metrics.clone(),
    )?;

    let mut pool = DownloadPool::start(
        Arc::clone(&store),
        Arc::clone(&state),
        active,
        metrics.clone(),
        config.processing.worker_count,
        config.processing.queue_size,
        line_tx,
    );

    let flusher = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        let save_interval = config.save_interval();
        tokio::spawn(async move { state.run(save_interval, cancel).await })
    };

    info!(
        bucket = config.bucket(),
        endpoints = config.http.endpoints.len(),
        download_workers = config.processing.worker_count,
        http_workers = config.http.workers,
        "pipeline started"
    );

    let mut ticker = tokio::time::interval(config.scan_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                scan_tick(&scanner, &pool, &state, &metrics).await;
            }
            () = cancel.cancelled() => break,
        }
    }

    info!("draining pipeline");
    pool.shutdown().await;
    sender.join().await;

    if let Err(e) = flusher.await {
        error!("state flusher panicked: {e}");
    }
    // Updates made while draining happened after the flusher's final
    // write; capture them too.
    if let Err(e) = state.flush().await {
        error!("final watermark flush failed: {e}");
    }

    telemetry.shutdown();
    info!(
        files = pool.files_processed(),
        errors = pool.errors(),
        batches = sender.sent_batches(),
        lines = sender.sent_lines(),
        "pipeline stopped"
    );
    Ok(())
}

/// One scan tick: discover eligible objects, enqueue until the job queue
/// pushes back, and refresh the lag gauge.
async fn scan_tick(
    scanner: &Scanner,
    pool: &DownloadPool,
    state: &StateStore,
    metrics: &Metrics,
) {
    let from = state.last_timestamp();
    let last_key = state.last_file();

    match scanner.scan(from, &last_key).await {
        Ok(jobs) => {
            let total = jobs.len();
            let mut submitted = 0usize;
            for job in jobs {
                // A full queue means downstream is saturated; defer the
                // remainder, the next scan rediscovers it.
                if !pool.submit(job) {
                    debug!(
                        deferred = total - submitted,
                        "job queue full, deferring rest of tick"
                    );
                    break;
                }
                submitted += 1;
            }
            if total > 0 {
                debug!(submitted, total, queue = pool.queue_len(), "scan tick");
            }
        }
        Err(e) => {
            // Watermark untouched; the next tick retries the same window.
            error!("scan tick failed: {e}");
            metrics.record_scan_error();
        }
    }

    let last = state.last_timestamp();
    if last > 0 {
        let lag = (Utc::now().timestamp() - last).max(0);
        metrics.update_processing_lag(lag as f64);
    }
}

/// Redis when configured and reachable, otherwise the local file. The
/// choice is made once; mid-run outages retry against the same backend.
async fn select_state_backend(config: &Config) -> Box<dyn StateBackend> {
    if config.state.redis.enabled {
        match RedisBackend::connect(&config.state.redis).await {
            Ok(backend) => {
                info!("using redis state backend");
                return Box::new(backend);
            }
            Err(e) => {
                warn!("redis state backend unreachable, falling back to local file: {e}");
            }
        }
    }
    Box::new(FileBackend::new(config.state.file_path.clone()))
}

/// Copies the local watermark into the Redis backend and exits.
pub async fn migrate_state(config: &Config) -> Result<(), SupervisorError> {
    if !config.state.redis.enabled {
        return Err(SupervisorError::MigrateWithoutRedis);
    }
    let source = FileBackend::new(config.state.file_path.clone());
    let target = RedisBackend::connect(&config.state.redis).await?;
    crate::state::migrate(&source, &target).await?;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received, beginning shutdown");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
