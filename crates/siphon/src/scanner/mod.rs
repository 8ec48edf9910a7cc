//! Time-windowed object discovery.
//!
//! Each scan tick translates the watermark and the configured delay window
//! into a key-space traversal: objects live under Hive-style day
//! partitions (`…/year=Y/month=M/day=D/`), so the scanner enumerates
//! exactly the partitions covering `[lower, upper]` UTC and lists each one
//! in lexicographic order. When the watermark key falls inside a
//! partition, the listing starts after it — one API call skips everything
//! already acknowledged.
//!
//! The delay window keeps the scanner away from objects whose producer may
//! still be flushing: `upper = now − delay_window`, and nothing younger is
//! ever considered. On a cold start the window floor is pulled back one
//! minute below `upper` so a fresh deployment begins with recent data
//! instead of the whole bucket.
//!
//! Keys whose basename does not parse under the active format are
//! expected (other feeds may share the bucket) and skipped without
//! logging. A listing failure aborts the tick; the watermark is untouched
//! and the next tick retries the same window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use thiserror::Error;
use tracing::debug;

use crate::formats::{LogFormat, Registry};

/// Cold-start lookback below the delay-window upper bound.
const COLD_START_LOOKBACK_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to list objects under {prefix}: {source}")]
    List {
        prefix: String,
        #[source]
        source: object_store::Error,
    },
}

/// One discovered object, ready for a download worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileJob {
    /// Full object key.
    pub key: String,
    /// Filename-derived timestamp, seconds since epoch.
    pub timestamp: i64,
    /// Size reported by the listing.
    pub size: i64,
}

/// Timestamp source for the scanner: a pinned descriptor, or per-key
/// detection when the pipeline runs in auto mode.
pub enum ActiveFormat {
    Pinned(Arc<dyn LogFormat>),
    Auto(Arc<Registry>),
}

impl ActiveFormat {
    fn extract_timestamp(&self, filename: &str) -> Option<i64> {
        match self {
            ActiveFormat::Pinned(format) => format.extract_timestamp(filename).ok(),
            ActiveFormat::Auto(registry) => {
                // No content sample exists at listing time; detection is
                // filename-only here.
                registry
                    .detect(filename, None)
                    .extract_timestamp(filename)
                    .ok()
            }
        }
    }
}

pub struct Scanner {
    store: Arc<dyn ObjectStore>,
    /// Normalized key prefix: empty, or ending in `/`.
    prefix: String,
    delay_window: Duration,
    format: ActiveFormat,
}

impl Scanner {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: String,
        delay_window: Duration,
        format: ActiveFormat,
    ) -> Scanner {
        Scanner {
            store,
            prefix,
            delay_window,
            format,
        }
    }

    /// Scans the window derived from the current wall clock.
    pub async fn scan(
        &self,
        from_timestamp: i64,
        last_key: &str,
    ) -> Result<Vec<FileJob>, ScanError> {
        self.scan_at(Utc::now().timestamp(), from_timestamp, last_key)
            .await
    }

    /// Scans with an explicit `now`, which pins the window for tests.
    pub async fn scan_at(
        &self,
        now: i64,
        from_timestamp: i64,
        last_key: &str,
    ) -> Result<Vec<FileJob>, ScanError> {
        let upper = now - self.delay_window.as_secs() as i64;
        let lower = if from_timestamp == 0 {
            upper - COLD_START_LOOKBACK_SECS
        } else {
            from_timestamp
        };
        if lower > upper {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for partition in self.day_partitions(lower, upper) {
            let found = self
                .list_partition(&partition, last_key, lower, upper)
                .await?;
            jobs.extend(found);
        }

        debug!(
            lower,
            upper,
            jobs = jobs.len(),
            "scan window complete"
        );
        Ok(jobs)
    }

    /// Day-partition prefixes covering `[lower, upper]`, earliest first.
    fn day_partitions(&self, lower: i64, upper: i64) -> Vec<String> {
        let from = DateTime::<Utc>::from_timestamp(lower, 0)
            .unwrap_or_default()
            .date_naive();
        let to = DateTime::<Utc>::from_timestamp(upper, 0)
            .unwrap_or_default()
            .date_naive();

        let mut prefixes = Vec::new();
        let mut day = from;
        while day <= to {
            prefixes.push(format!(
                "{}year={}/month={}/day={}/",
                self.prefix,
                day.year(),
                day.month(),
                day.day()
            ));
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }
        prefixes
    }

    /// Lists one partition and keeps the objects inside the window.
    async fn list_partition(
        &self,
        partition: &str,
        last_key: &str,
        lower: i64,
        upper: i64,
    ) -> Result<Vec<FileJob>, ScanError> {
        let prefix = ObjectPath::from(partition);

        // Start after the watermark key when it lies in this partition so
        // already-acknowledged objects never leave the store.
        let mut stream = if !last_key.is_empty() && last_key.starts_with(partition) {
            let offset = ObjectPath::from(last_key);
            self.store.list_with_offset(Some(&prefix), &offset)
        } else {
            self.store.list(Some(&prefix))
        };

        let mut jobs = Vec::new();
        while let Some(entry) = stream.next().await {
            let meta = entry.map_err(|source| ScanError::List {
                prefix: partition.to_string(),
                source,
            })?;

            let key = meta.location.to_string();
            let basename = key.rsplit('/').next().unwrap_or(&key);

            // Keys that do not parse under the active format are other
            // feeds sharing the bucket; skip them quietly.
            let Some(timestamp) = self.format.extract_timestamp(basename) else {
                continue;
            };
            if timestamp < lower || timestamp > upper {
                continue;
            }

            jobs.push(FileJob {
                key,
                timestamp,
                size: meta.size as i64,
            });
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use object_store::memory::InMemory;
    use object_store::PutPayload;

    const DELAY: Duration = Duration::from_secs(60);

    async fn store_with(keys: &[&str]) -> Arc<InMemory> {
        let store = Arc::new(InMemory::new());
        for key in keys {
            store
                .put(&ObjectPath::from(*key), PutPayload::from_static(b"x"))
                .await
                .unwrap();
        }
        store
    }

    fn zscaler_scanner(store: Arc<InMemory>, prefix: &str) -> Scanner {
        Scanner::new(
            store,
            prefix.to_string(),
            DELAY,
            ActiveFormat::Pinned(Arc::new(crate::formats::ZscalerFormat)),
        )
    }

    fn day_key(ts: i64, suffix: &str) -> String {
        let day = DateTime::<Utc>::from_timestamp(ts, 0).unwrap();
        format!(
            "logs/year={}/month={}/day={}/{ts}_{suffix}.gz",
            day.year(),
            day.month(),
            day.day()
        )
    }

    #[tokio::test]
    async fn cold_start_emits_recent_object() {
        let ts = 1760305292i64;
        let key = day_key(ts, "56442_130_1");
        let store = store_with(&[&key]).await;
        let scanner = zscaler_scanner(store, "logs/");

        // Window is [now - delay - 60s, now - delay]; place the object
        // inside it.
        let now = ts + 70;
        let jobs = scanner.scan_at(now, 0, "").await.unwrap();
        assert_eq!(
            jobs,
            vec![FileJob {
                key,
                timestamp: ts,
                size: 1
            }]
        );
    }

    #[tokio::test]
    async fn cold_start_skips_objects_below_lookback() {
        let ts = 1760305292i64;
        let key = day_key(ts, "56442_130_1");
        let store = store_with(&[&key]).await;
        let scanner = zscaler_scanner(store, "logs/");

        // Object is 208s old: below the one-minute cold-start floor.
        let jobs = scanner.scan_at(ts + 208, 0, "").await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn delay_window_excludes_young_objects() {
        let ts = 1760305292i64;
        let key = day_key(ts, "56442_130_1");
        let store = store_with(&[&key]).await;
        let scanner = zscaler_scanner(store, "logs/");

        // Object is only 30s old; the 60s delay window hides it.
        let jobs = scanner.scan_at(ts + 30, ts - 600, "").await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn restart_convergence_skips_at_or_below_watermark() {
        let t = 1760305000i64;
        let keys = [
            day_key(t - 10, "1_1_1"),
            day_key(t + 5, "1_1_2"),
            day_key(t + 20, "1_1_3"),
        ];
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let store = store_with(&refs).await;
        let scanner = zscaler_scanner(store, "logs/");

        let jobs = scanner.scan_at(t + 600, t, "").await.unwrap();
        let timestamps: Vec<i64> = jobs.iter().map(|j| j.timestamp).collect();
        assert_eq!(timestamps, vec![t + 5, t + 20]);
    }

    #[tokio::test]
    async fn last_key_shortcuts_listing_within_partition() {
        let t = 1760305000i64;
        let first = day_key(t, "1_1_1");
        let second = day_key(t, "1_1_2");
        let store = store_with(&[&first, &second]).await;
        let scanner = zscaler_scanner(store, "logs/");

        // Same timestamp as the watermark: only keys after last_key may
        // surface.
        let jobs = scanner.scan_at(t + 600, t, &first).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, second);
    }

    #[tokio::test]
    async fn unparseable_keys_skipped_silently() {
        let t = 1760305000i64;
        let good = day_key(t, "1_1_1");
        let day = DateTime::<Utc>::from_timestamp(t, 0).unwrap();
        let noise = format!(
            "logs/year={}/month={}/day={}/manifest.json",
            day.year(),
            day.month(),
            day.day()
        );
        let store = store_with(&[&good, &noise]).await;
        let scanner = zscaler_scanner(store, "logs/");

        let jobs = scanner.scan_at(t + 600, t - 100, "").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, good);
    }

    #[tokio::test]
    async fn window_spanning_midnight_visits_both_partitions() {
        // 2025-10-12T23:59:40Z and 2025-10-13T00:00:20Z.
        let before = 1760313580i64;
        let after = 1760313620i64;
        let keys = [day_key(before, "1_1_1"), day_key(after, "1_1_2")];
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let store = store_with(&refs).await;
        let scanner = zscaler_scanner(store, "logs/");

        let jobs = scanner
            .scan_at(after + 600, before - 1, "")
            .await
            .unwrap();
        let timestamps: Vec<i64> = jobs.iter().map(|j| j.timestamp).collect();
        assert_eq!(timestamps, vec![before, after]);
    }

    #[tokio::test]
    async fn empty_window_returns_no_jobs() {
        let store = store_with(&[]).await;
        let scanner = zscaler_scanner(store, "logs/");
        let jobs = scanner.scan_at(1760305000, 1760304000, "").await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn auto_mode_detects_per_key() {
        let ts = 1760305292i64;
        let zscaler_key = day_key(ts, "56442_130_1");
        // A cisco-named object in the same partition, same minute.
        let day = DateTime::<Utc>::from_timestamp(ts, 0).unwrap();
        let cisco_ts = Utc
            .with_ymd_and_hms(day.year(), day.month(), day.day(), 22, 21, 0)
            .single()
            .unwrap()
            .timestamp();
        let cisco_key = format!(
            "logs/year={}/month={}/day={}/{}-{:02}-{:02}-22-21-0001.csv.gz",
            day.year(),
            day.month(),
            day.day(),
            day.year(),
            day.month(),
            day.day()
        );
        let store = store_with(&[&zscaler_key, &cisco_key]).await;

        let scanner = Scanner::new(
            store,
            "logs/".to_string(),
            DELAY,
            ActiveFormat::Auto(Arc::new(Registry::new())),
        );

        let lower = cisco_ts.min(ts) - 1;
        let upper_now = cisco_ts.max(ts) + 70;
        let jobs = scanner.scan_at(upper_now, lower, "").await.unwrap();
        assert_eq!(jobs.len(), 2);
    }
}
