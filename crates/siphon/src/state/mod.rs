//! Durable processing watermark.
//!
//! The watermark records the last object successfully forwarded (timestamp
//! plus key) together with lifetime counters, so a restart resumes where
//! the previous run stopped instead of re-mirroring the whole window.
//!
//! One mutation contract, two persistence backends:
//!
//! - [`file::FileBackend`] — JSON on local disk, written atomically via a
//!   temp file and rename
//! - [`redis::RedisBackend`] — a single key in a shared cache, which lets
//!   a replacement instance on another host pick up the same watermark
//!
//! [`StateStore`] is the single serialization point. Download workers call
//! [`StateStore::update`] concurrently; persistence runs on a periodic
//! tick plus one final flush at shutdown. A failed persist keeps the store
//! dirty so the next tick retries — the backend chosen at startup is never
//! swapped at runtime.

pub mod file;
pub mod redis;

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("redis state error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Persisted progress record.
///
/// Field names are the wire/file layout; both backends serialize this
/// struct as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
    pub last_processed_timestamp: i64,
    pub last_processed_file: String,
    pub total_files_processed: i64,
    pub total_bytes_processed: i64,
    pub last_updated: i64,
}

/// Persistence behind the store: load at startup, persist on flush.
#[async_trait::async_trait]
pub trait StateBackend: Send + Sync {
    /// Reads the persisted record. `Ok(None)` means "nothing persisted
    /// yet" and yields a zero-valued initial state; any error is fatal at
    /// startup.
    async fn load(&self) -> Result<Option<State>, StateError>;

    /// Persists the record atomically.
    async fn persist(&self, state: &State) -> Result<(), StateError>;

    /// Backend label for logs.
    fn name(&self) -> &'static str;
}

struct Inner {
    state: State,
    /// Bumped on every update; the store is dirty while it is ahead of
    /// `persisted_version`.
    version: u64,
    persisted_version: u64,
}

/// Concurrent-safe watermark store over a pluggable backend.
pub struct StateStore {
    inner: RwLock<Inner>,
    backend: Box<dyn StateBackend>,
}

impl StateStore {
    /// Loads persisted state (zero state when the backend has none) and
    /// wraps it in a store.
    pub async fn open(backend: Box<dyn StateBackend>) -> Result<StateStore, StateError> {
        let state = match backend.load().await? {
            Some(state) => {
                info!(
                    backend = backend.name(),
                    last_timestamp = state.last_processed_timestamp,
                    last_file = %state.last_processed_file,
                    "loaded watermark"
                );
                state
            }
            None => {
                info!(backend = backend.name(), "no persisted watermark, starting fresh");
                State {
                    last_updated: chrono::Utc::now().timestamp(),
                    ..State::default()
                }
            }
        };

        Ok(StateStore {
            inner: RwLock::new(Inner {
                state,
                version: 0,
                persisted_version: 0,
            }),
            backend,
        })
    }

    /// Records a successfully processed object.
    ///
    /// The timestamp floor only moves forward; the key is set
    /// unconditionally so two objects sharing a timestamp still advance
    /// the listing shortcut.
    pub fn update(&self, timestamp: i64, key: &str, bytes: i64) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        if timestamp > inner.state.last_processed_timestamp {
            inner.state.last_processed_timestamp = timestamp;
        }
        inner.state.last_processed_file = key.to_string();
        inner.state.total_files_processed += 1;
        inner.state.total_bytes_processed += bytes;
        inner.state.last_updated = chrono::Utc::now().timestamp();
        inner.version += 1;
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> State {
        self.inner.read().expect("state lock poisoned").state.clone()
    }

    pub fn last_timestamp(&self) -> i64 {
        self.inner
            .read()
            .expect("state lock poisoned")
            .state
            .last_processed_timestamp
    }

    pub fn last_file(&self) -> String {
        self.inner
            .read()
            .expect("state lock poisoned")
            .state
            .last_processed_file
            .clone()
    }

    /// Persists the state if it changed since the last successful flush.
    ///
    /// The snapshot is taken under the lock but persistence happens
    /// outside it; updates racing the persist keep the store dirty for
    /// the next tick.
    pub async fn flush(&self) -> Result<(), StateError> {
        let (state, version) = {
            let inner = self.inner.read().expect("state lock poisoned");
            if inner.version == inner.persisted_version {
                return Ok(());
            }
            (inner.state.clone(), inner.version)
        };

        self.backend.persist(&state).await?;

        let mut inner = self.inner.write().expect("state lock poisoned");
        if version > inner.persisted_version {
            inner.persisted_version = version;
        }
        Ok(())
    }

    /// Periodic flusher: persists every `save_interval` until cancelled,
    /// then performs one final flush. Persist failures are logged and
    /// retried on the next tick.
    pub async fn run(&self, save_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(save_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(backend = self.backend.name(), "failed to persist watermark: {e}");
                    }
                }
                () = cancel.cancelled() => {
                    break;
                }
            }
        }

        debug!("state flusher stopping, writing final watermark");
        if let Err(e) = self.flush().await {
            error!(backend = self.backend.name(), "final watermark flush failed: {e}");
        }
    }
}

/// Copies the locally persisted watermark into the remote backend.
/// Used by `--migrate-state`.
pub async fn migrate(
    source: &dyn StateBackend,
    target: &dyn StateBackend,
) -> Result<State, StateError> {
    let state = source.load().await?.unwrap_or_default();
    target.persist(&state).await?;
    info!(
        from = source.name(),
        to = target.name(),
        last_timestamp = state.last_processed_timestamp,
        files = state.total_files_processed,
        "migrated watermark"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::file::FileBackend;
    use super::*;

    fn temp_backend() -> (tempfile::TempDir, Box<dyn StateBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("state.json"));
        (dir, Box::new(backend))
    }

    #[tokio::test]
    async fn open_without_persisted_state_starts_zeroed() {
        let (_dir, backend) = temp_backend();
        let store = StateStore::open(backend).await.unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.last_processed_timestamp, 0);
        assert_eq!(snap.last_processed_file, "");
        assert_eq!(snap.total_files_processed, 0);
    }

    #[tokio::test]
    async fn update_advances_timestamp_monotonically() {
        let (_dir, backend) = temp_backend();
        let store = StateStore::open(backend).await.unwrap();

        store.update(100, "a", 10);
        store.update(90, "b", 10);
        let snap = store.snapshot();
        // The floor never moves backwards; the key always does.
        assert_eq!(snap.last_processed_timestamp, 100);
        assert_eq!(snap.last_processed_file, "b");
        assert_eq!(snap.total_files_processed, 2);
        assert_eq!(snap.total_bytes_processed, 20);
    }

    #[tokio::test]
    async fn equal_timestamp_updates_key_only() {
        let (_dir, backend) = temp_backend();
        let store = StateStore::open(backend).await.unwrap();
        store.update(100, "first", 1);
        store.update(100, "second", 1);
        let snap = store.snapshot();
        assert_eq!(snap.last_processed_timestamp, 100);
        assert_eq!(snap.last_processed_file, "second");
    }

    #[tokio::test]
    async fn flush_persists_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(Box::new(FileBackend::new(path.clone())))
            .await
            .unwrap();
        store.update(1760305292, "logs/year=2025/month=10/day=12/1760305292_1_1_1.gz", 4096);
        store.flush().await.unwrap();

        let reopened = StateStore::open(Box::new(FileBackend::new(path)))
            .await
            .unwrap();
        let snap = reopened.snapshot();
        assert_eq!(snap.last_processed_timestamp, 1760305292);
        assert_eq!(
            snap.last_processed_file,
            "logs/year=2025/month=10/day=12/1760305292_1_1_1.gz"
        );
        assert_eq!(snap.total_files_processed, 1);
        assert_eq!(snap.total_bytes_processed, 4096);
    }

    #[tokio::test]
    async fn clean_flush_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::open(Box::new(FileBackend::new(path.clone())))
            .await
            .unwrap();

        // Never updated: flush must not create the file.
        store.flush().await.unwrap();
        assert!(!path.exists());

        store.update(1, "a", 1);
        store.flush().await.unwrap();
        assert!(path.exists());
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        // Clean again: no rewrite.
        store.flush().await.unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            modified
        );
    }

    #[tokio::test]
    async fn run_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = std::sync::Arc::new(
            StateStore::open(Box::new(FileBackend::new(path.clone())))
                .await
                .unwrap(),
        );

        let cancel = CancellationToken::new();
        let flusher = {
            let store = std::sync::Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store.run(Duration::from_secs(3600), cancel).await;
            })
        };

        store.update(42, "obj", 7);
        cancel.cancel();
        flusher.await.unwrap();

        // Final flush happened even though no periodic tick ever fired.
        let reopened = StateStore::open(Box::new(FileBackend::new(path)))
            .await
            .unwrap();
        assert_eq!(reopened.snapshot().last_processed_timestamp, 42);
    }

    #[tokio::test]
    async fn migrate_copies_state_between_backends() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileBackend::new(dir.path().join("source.json"));
        let target = FileBackend::new(dir.path().join("target.json"));

        source
            .persist(&State {
                last_processed_timestamp: 123,
                last_processed_file: "k".to_string(),
                total_files_processed: 9,
                total_bytes_processed: 900,
                last_updated: 1,
            })
            .await
            .unwrap();

        let migrated = migrate(&source, &target).await.unwrap();
        assert_eq!(migrated.last_processed_timestamp, 123);
        assert_eq!(target.load().await.unwrap().unwrap(), migrated);
    }
}
