//! Memory backend plus a JSON snapshot file with atomic replace.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    tally_config::StorageConfig,
    tokio::{
        fs,
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    backend::{Lifecycle, MetricsBackend},
    memory::MemoryBackend,
    model::{Metric, MetricKind, MetricUpdate, MetricValue, MetricsSnapshot},
};

/// When the snapshot file is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// After every accepted update or batch.
    Sync,
    /// From a background task on a fixed period.
    Interval(Duration),
    /// Only on close.
    Manual,
}

impl FlushPolicy {
    #[must_use]
    pub fn from_config(cfg: &StorageConfig) -> Self {
        if cfg.sync_flush {
            return Self::Sync;
        }
        match cfg.store_interval() {
            Duration::ZERO => Self::Manual,
            period => Self::Interval(period),
        }
    }
}

/// The on-disk snapshot. Writers are serialized so a slower flush never
/// overwrites a newer one.
#[derive(Debug)]
struct SnapshotFile {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl SnapshotFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Write the current contents of `state`. Returns the number of metrics.
    async fn save(&self, state: &MemoryBackend) -> Result<usize> {
        let _writer = self.write_lock.lock().await;
        let metrics = state.snapshot().to_metrics();
        let json = serde_json::to_vec_pretty(&metrics)?;

        let tmp = self.tmp_path();
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(metrics.len())
    }

    /// `Ok(None)` when there is nothing to restore.
    async fn load(&self) -> Result<Option<MetricsSnapshot>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::restore_failed(&self.path, e)),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let metrics: Vec<Metric> =
            serde_json::from_slice(&data).map_err(|e| Error::restore_failed(&self.path, e))?;
        MetricsSnapshot::from_metrics(metrics)
            .map(Some)
            .map_err(|e| Error::restore_failed(&self.path, e))
    }
}

/// Backend that keeps state in memory and mirrors it to a snapshot file.
pub struct FileBackend {
    state: Arc<MemoryBackend>,
    file: Arc<SnapshotFile>,
    policy: FlushPolicy,
    lifecycle: Lifecycle,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    /// Set once the final snapshot has been written.
    finalized: tokio::sync::Mutex<bool>,
}

impl FileBackend {
    /// Open the snapshot at `path`, restoring it first when `restore` is set.
    ///
    /// A snapshot that cannot be read is logged and skipped; the backend then
    /// starts empty. The parent directory is created if missing.
    pub async fn open(path: impl Into<PathBuf>, policy: FlushPolicy, restore: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file = Arc::new(SnapshotFile::new(path));
        let state = Arc::new(MemoryBackend::new());

        if restore {
            match file.load().await {
                Ok(Some(snapshot)) => {
                    info!(path = %file.path.display(), metrics = snapshot.len(), "restored metrics snapshot");
                    state.replace(snapshot);
                },
                Ok(None) => debug!(path = %file.path.display(), "no snapshot to restore"),
                Err(e) => warn!(error = %e, "starting with empty metrics store"),
            }
        }

        let cancel = CancellationToken::new();
        let flusher = match policy {
            FlushPolicy::Interval(period) => Some(spawn_flusher(
                Arc::clone(&state),
                Arc::clone(&file),
                period,
                cancel.clone(),
            )),
            FlushPolicy::Sync | FlushPolicy::Manual => None,
        };

        Ok(Self {
            state,
            file,
            policy,
            lifecycle: Lifecycle::default(),
            cancel,
            flusher: Mutex::new(flusher),
            finalized: tokio::sync::Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Write the snapshot now, regardless of policy.
    pub async fn flush(&self) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        self.file.save(&self.state).await.map(drop)
    }

    /// Under [`FlushPolicy::Sync`], persist an update that is already applied
    /// in memory. A failed write is logged, not returned: the update stays
    /// accepted and the next flush or `close` carries it to disk.
    async fn flush_if_sync(&self) {
        if self.policy != FlushPolicy::Sync {
            return;
        }
        if let Err(e) = self.file.save(&self.state).await {
            warn!(path = %self.file.path.display(), error = %e, "sync snapshot failed, deferring to next flush");
        }
    }
}

fn spawn_flusher(
    state: Arc<MemoryBackend>,
    file: Arc<SnapshotFile>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match file.save(&state).await {
                    Ok(count) => debug!(path = %file.path.display(), count, "metrics snapshot written"),
                    Err(e) => warn!(path = %file.path.display(), error = %e, "periodic snapshot failed"),
                },
            }
        }
    })
}

#[async_trait]
impl MetricsBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn upsert(&self, update: MetricUpdate) -> Result<MetricValue> {
        let _open = self.lifecycle.enter().await?;
        let stored = self.state.upsert(update).await?;
        self.flush_if_sync().await;
        Ok(stored)
    }

    async fn upsert_batch(&self, updates: Vec<MetricUpdate>) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        let applied = self.state.upsert_batch(updates).await;
        // Items before a failing one are kept, so persist them either way.
        self.flush_if_sync().await;
        applied
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Option<MetricValue>> {
        let _open = self.lifecycle.enter().await?;
        self.state.get(name, kind).await
    }

    async fn get_all(&self) -> Result<MetricsSnapshot> {
        let _open = self.lifecycle.enter().await?;
        self.state.get_all().await
    }

    async fn health_check(&self) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        self.state.health_check().await
    }

    /// Stops the background flusher and writes the final snapshot. If that
    /// write fails the backend stays closed to operations, but the next
    /// `close` tries the write again.
    async fn close(&self) -> Result<()> {
        let mut finalized = self.finalized.lock().await;
        if *finalized {
            return Ok(());
        }
        self.lifecycle.close().await;

        self.cancel.cancel();
        let flusher = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = flusher
            && let Err(e) = handle.await
        {
            warn!(error = %e, "snapshot task ended abnormally");
        }

        let saved = self.file.save(&self.state).await;
        self.state.close().await?;
        let count = saved?;
        *finalized = true;
        info!(path = %self.file.path.display(), count, "final metrics snapshot written");
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn update(name: &str, kind: &str, raw: &str) -> MetricUpdate {
        MetricUpdate::parse(name, kind, raw).unwrap()
    }

    fn storage(sync_flush: bool, store_interval: u64) -> StorageConfig {
        StorageConfig {
            sync_flush,
            store_interval,
            ..StorageConfig::default()
        }
    }

    #[rstest]
    #[case(storage(true, 300), FlushPolicy::Sync)]
    #[case(storage(true, 0), FlushPolicy::Sync)]
    #[case(storage(false, 0), FlushPolicy::Manual)]
    #[case(storage(false, 5), FlushPolicy::Interval(Duration::from_secs(5)))]
    fn policy_from_config(#[case] cfg: StorageConfig, #[case] expected: FlushPolicy) {
        assert_eq!(FlushPolicy::from_config(&cfg), expected);
    }

    #[tokio::test]
    async fn sync_flush_writes_after_each_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let backend = FileBackend::open(&path, FlushPolicy::Sync, true).await.unwrap();

        backend.upsert(update("PollCount", "counter", "2")).await.unwrap();

        let on_disk: Vec<Metric> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec![Metric::counter("PollCount", 2)]);
        assert!(!backend.file.tmp_path().exists());
    }

    #[tokio::test]
    async fn sync_flush_survives_drop_without_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let backend = FileBackend::open(&path, FlushPolicy::Sync, true).await.unwrap();
        backend.upsert(update("PollCount", "counter", "4")).await.unwrap();
        backend.upsert(update("PollCount", "counter", "6")).await.unwrap();
        backend
            .upsert_batch(vec![update("Alloc", "gauge", "1.25"), update("PollCount", "counter", "1")])
            .await
            .unwrap();
        drop(backend);

        let restored = FileBackend::open(&path, FlushPolicy::Sync, true).await.unwrap();
        assert_eq!(
            restored.get("PollCount", MetricKind::Counter).await.unwrap(),
            Some(MetricValue::Counter(11))
        );
        assert_eq!(
            restored.get("Alloc", MetricKind::Gauge).await.unwrap(),
            Some(MetricValue::Gauge(1.25))
        );
    }

    /// Make `path` unwritable as a snapshot target: a non-empty directory
    /// cannot be renamed over.
    fn block_path(path: &Path) {
        std::fs::create_dir_all(path.join("occupied")).unwrap();
    }

    #[tokio::test]
    async fn failed_sync_write_keeps_update_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        block_path(&path);

        let backend = FileBackend::open(&path, FlushPolicy::Sync, false).await.unwrap();
        for expected in [5, 10, 15] {
            assert_eq!(
                backend.upsert(update("hits", "counter", "5")).await.unwrap(),
                MetricValue::Counter(expected)
            );
        }
        assert_eq!(
            backend.get("hits", MetricKind::Counter).await.unwrap(),
            Some(MetricValue::Counter(15))
        );

        std::fs::remove_dir_all(&path).unwrap();
        backend.close().await.unwrap();
        let on_disk: Vec<Metric> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec![Metric::counter("hits", 15)]);
    }

    #[tokio::test]
    async fn failed_final_write_is_retried_by_next_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        block_path(&path);

        let backend = FileBackend::open(&path, FlushPolicy::Manual, false).await.unwrap();
        backend.upsert(update("hits", "counter", "7")).await.unwrap();

        assert!(matches!(backend.close().await, Err(Error::Io(_))));
        assert!(matches!(backend.health_check().await, Err(Error::BackendClosed)));
        assert!(matches!(backend.state.health_check().await, Err(Error::BackendClosed)));

        std::fs::remove_dir_all(&path).unwrap();
        backend.close().await.unwrap();
        backend.close().await.unwrap();

        let on_disk: Vec<Metric> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec![Metric::counter("hits", 7)]);
    }

    #[tokio::test]
    async fn close_writes_final_snapshot_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.json");

        let backend = FileBackend::open(&path, FlushPolicy::Manual, true).await.unwrap();
        backend.upsert(update("hits", "counter", "5")).await.unwrap();
        backend.upsert(update("hits", "counter", "7")).await.unwrap();
        backend.upsert(update("load", "gauge", "0.1")).await.unwrap();
        backend.upsert(update("hits", "gauge", "-3.5")).await.unwrap();
        assert!(!path.exists());

        backend.close().await.unwrap();
        backend.close().await.unwrap();

        let reopened = FileBackend::open(&path, FlushPolicy::Manual, true).await.unwrap();
        let all = reopened.get_all().await.unwrap();
        assert_eq!(all.counters["hits"], 12);
        assert_eq!(all.gauges["hits"], -3.5);
        assert_eq!(all.gauges["load"], 0.1);
    }

    #[tokio::test]
    async fn restore_disabled_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, r#"[{"id":"a","type":"counter","delta":3}]"#).unwrap();

        let backend = FileBackend::open(&path, FlushPolicy::Manual, false).await.unwrap();
        assert!(backend.get_all().await.unwrap().is_empty());
    }

    #[rstest]
    #[case::garbage("{not json")]
    #[case::wrong_shape(r#"{"id":"a"}"#)]
    #[case::missing_delta(r#"[{"id":"a","type":"counter"}]"#)]
    #[tokio::test]
    async fn malformed_snapshot_is_skipped(#[case] contents: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, contents).unwrap();

        let file = SnapshotFile::new(path.clone());
        assert!(matches!(file.load().await, Err(Error::RestoreFailed { .. })));

        let backend = FileBackend::open(&path, FlushPolicy::Manual, true).await.unwrap();
        assert!(backend.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "\n").unwrap();

        let file = SnapshotFile::new(path);
        assert!(file.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interval_policy_flushes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let backend = FileBackend::open(&path, FlushPolicy::Interval(Duration::from_millis(50)), true)
            .await
            .unwrap();

        backend.upsert(update("temp", "gauge", "21.5")).await.unwrap();

        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let on_disk: Vec<Metric> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec![Metric::gauge("temp", 21.5)]);
        backend.close().await.unwrap();
    }

    /// A crash loses only what arrived after the last successful flush.
    #[tokio::test]
    async fn crash_keeps_last_flushed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let backend = FileBackend::open(&path, FlushPolicy::Manual, true).await.unwrap();
        backend.upsert(update("PollCount", "counter", "10")).await.unwrap();
        backend.flush().await.unwrap();
        backend.upsert(update("PollCount", "counter", "5")).await.unwrap();
        drop(backend);

        let restored = FileBackend::open(&path, FlushPolicy::Manual, true).await.unwrap();
        assert_eq!(
            restored.get("PollCount", MetricKind::Counter).await.unwrap(),
            Some(MetricValue::Counter(10))
        );
    }

    #[tokio::test]
    async fn sync_batch_persists_prefix_before_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let backend = FileBackend::open(&path, FlushPolicy::Sync, true).await.unwrap();
        backend
            .upsert(MetricUpdate::new("max", MetricValue::Counter(i64::MAX)).unwrap())
            .await
            .unwrap();

        let err = backend
            .upsert_batch(vec![update("a", "gauge", "1"), update("max", "counter", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchItem { index: 1, .. }));

        let on_disk: Vec<Metric> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(on_disk.contains(&Metric::gauge("a", 1.0)));
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("m.json"), FlushPolicy::Sync, true)
            .await
            .unwrap();
        backend.close().await.unwrap();

        assert!(matches!(backend.health_check().await, Err(Error::BackendClosed)));
        assert!(matches!(backend.flush().await, Err(Error::BackendClosed)));
    }
}
