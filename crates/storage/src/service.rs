//! Validation front for whichever backend is configured.

use std::sync::Arc;

use {
    tally_config::StorageConfig,
    tracing::{debug, info},
};

use crate::{
    Error, Result,
    backend::MetricsBackend,
    database::SqliteBackend,
    file::{FileBackend, FlushPolicy},
    memory::MemoryBackend,
    model::{Metric, MetricKind, MetricUpdate, MetricValue, MetricsSnapshot},
    retry::RetryPolicy,
};

/// Entry point for every metric read and write.
///
/// Parses and validates raw input, then delegates to the backend chosen at
/// construction. Holds no metric state of its own; clones share the backend.
#[derive(Clone)]
pub struct MetricsService {
    backend: Arc<dyn MetricsBackend>,
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl MetricsService {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// In-memory service, mostly for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Pick the backend: database when a DSN is set, otherwise a snapshot file
    /// when a path is set, otherwise memory.
    pub async fn from_config(cfg: &StorageConfig) -> Result<Self> {
        let backend: Arc<dyn MetricsBackend> = if let Some(dsn) = cfg.database_dsn() {
            let policy = RetryPolicy::from(&cfg.retry);
            Arc::new(SqliteBackend::connect(dsn, policy).await?)
        } else if let Some(path) = cfg.file_storage_path() {
            let policy = FlushPolicy::from_config(cfg);
            Arc::new(FileBackend::open(path.clone(), policy, cfg.restore).await?)
        } else {
            Arc::new(MemoryBackend::new())
        };
        info!(backend = backend.name(), "metrics storage ready");
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Apply a single update given as raw strings (`kind` is "counter" or
    /// "gauge", `raw` the decimal payload).
    pub async fn update(&self, name: &str, kind: &str, raw: &str) -> Result<MetricValue> {
        let update = MetricUpdate::parse(name, kind, raw)?;
        self.backend.upsert(update).await
    }

    /// Apply one JSON record and return it with the stored value filled in.
    pub async fn update_metric(&self, metric: Metric) -> Result<Metric> {
        let update = metric.into_update()?;
        let name = update.name.clone();
        let stored = self.backend.upsert(update).await?;
        Ok(Metric::from_value(name, stored))
    }

    /// Validate every record, then hand the whole batch to the backend.
    ///
    /// An invalid record rejects the batch before anything is written.
    pub async fn update_batch(&self, metrics: Vec<Metric>) -> Result<()> {
        let updates = metrics
            .into_iter()
            .enumerate()
            .map(|(index, metric)| {
                let name = metric.id.clone();
                metric
                    .into_update()
                    .map_err(|e| Error::batch_item(index, name, e))
            })
            .collect::<Result<Vec<_>>>()?;
        if updates.is_empty() {
            debug!("empty metric batch");
            return Ok(());
        }
        self.backend.upsert_batch(updates).await
    }

    /// Rendered current value, or `None` if never written.
    pub async fn value(&self, name: &str, kind: MetricKind) -> Result<Option<String>> {
        Ok(self.backend.get(name, kind).await?.map(|v| v.to_string()))
    }

    pub async fn metric(&self, name: &str, kind: MetricKind) -> Result<Option<Metric>> {
        Ok(self
            .backend
            .get(name, kind)
            .await?
            .map(|v| Metric::from_value(name, v)))
    }

    pub async fn all(&self) -> Result<MetricsSnapshot> {
        self.backend.get_all().await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}
