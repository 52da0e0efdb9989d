//! Storage contract shared by the memory, file, and database backends.

use {
    async_trait::async_trait,
    tokio::sync::{RwLock, RwLockReadGuard},
};

use crate::{
    Error, Result,
    model::{MetricKind, MetricUpdate, MetricValue, MetricsSnapshot},
};

/// Persistence backend for metric values.
///
/// Every method is safe to call concurrently with every other. After
/// [`MetricsBackend::close`] has begun, all operations except `close` fail
/// with [`Error::BackendClosed`].
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Short name for logs ("memory", "file", "database").
    fn name(&self) -> &'static str;

    /// Merge one update and return the new stored value.
    async fn upsert(&self, update: MetricUpdate) -> Result<MetricValue>;

    /// Merge every update in order.
    ///
    /// Memory and file backends apply items one by one and stop at the first
    /// failure; the database backend applies all or none. Either way a
    /// failure is reported as [`Error::BatchItem`].
    async fn upsert_batch(&self, updates: Vec<MetricUpdate>) -> Result<()>;

    /// `None` means the metric was never written.
    async fn get(&self, name: &str, kind: MetricKind) -> Result<Option<MetricValue>>;

    async fn get_all(&self) -> Result<MetricsSnapshot>;

    async fn health_check(&self) -> Result<()>;

    /// Flush and release resources. Repeated calls are no-ops.
    async fn close(&self) -> Result<()>;
}

/// Open/closed gate.
///
/// Operations hold a read guard for their whole duration; `close` takes the
/// write side, so it waits for in-flight operations and everything queued
/// behind it observes the closed flag.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    closed: RwLock<bool>,
}

impl Lifecycle {
    pub(crate) async fn enter(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.closed.read().await;
        if *guard {
            return Err(Error::BackendClosed);
        }
        Ok(guard)
    }

    /// Returns `true` for the call that actually closed the gate.
    pub(crate) async fn close(&self) -> bool {
        let mut closed = self.closed.write().await;
        !std::mem::replace(&mut *closed, true)
    }
}
