//! In-process backend. Also the state holder behind the file backend.

use std::sync::Mutex;

use {async_trait::async_trait, tracing::debug};

use crate::{
    Error, Result,
    backend::{Lifecycle, MetricsBackend},
    model::{MetricKind, MetricUpdate, MetricValue, MetricsSnapshot},
};

/// `MetricsSnapshot` behind a mutex. Each merge is one critical section;
/// nothing here touches disk or network.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MetricsSnapshot>,
    lifecycle: Lifecycle,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-loaded with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: MetricsSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Copy of the current state, taken under the lock.
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the whole state.
    pub(crate) fn replace(&self, snapshot: MetricsSnapshot) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    fn apply(&self, update: &MetricUpdate) -> Result<MetricValue> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.apply(update)
    }

    fn apply_batch(&self, updates: &[MetricUpdate]) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (index, update) in updates.iter().enumerate() {
            state
                .apply(update)
                .map_err(|e| Error::batch_item(index, &update.name, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, update: MetricUpdate) -> Result<MetricValue> {
        let _open = self.lifecycle.enter().await?;
        let stored = self.apply(&update)?;
        debug!(name = %update.name, kind = %update.kind(), value = %stored, "metric updated");
        Ok(stored)
    }

    async fn upsert_batch(&self, updates: Vec<MetricUpdate>) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        self.apply_batch(&updates)?;
        debug!(count = updates.len(), "metric batch applied");
        Ok(())
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Option<MetricValue>> {
        let _open = self.lifecycle.enter().await?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.get(name, kind))
    }

    async fn get_all(&self) -> Result<MetricsSnapshot> {
        let _open = self.lifecycle.enter().await?;
        Ok(self.snapshot())
    }

    async fn health_check(&self) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.lifecycle.close().await {
            debug!("memory backend closed");
        }
        Ok(())
    }
}
