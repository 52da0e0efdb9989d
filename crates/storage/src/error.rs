use std::path::PathBuf;

use {crate::model::MetricKind, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid metric type: {reason}")]
    InvalidMetricKind { reason: String },

    #[error("invalid {kind} value: {value}")]
    InvalidMetricValue { kind: MetricKind, value: String },

    #[error("metric name must not be empty")]
    InvalidMetricName,

    #[error("failed to restore snapshot {}: {source}", path.display())]
    RestoreFailed {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("storage unavailable after {attempts} attempts: {source}")]
    TransientStorage {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("storage error: {source}")]
    TerminalStorage {
        #[source]
        source: sqlx::Error,
    },

    #[error("storage backend is closed")]
    BackendClosed,

    #[error("batch item {index} ({name}) failed: {source}")]
    BatchItem {
        index: usize,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_kind(reason: impl Into<String>) -> Self {
        Self::InvalidMetricKind {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn invalid_value(kind: MetricKind, value: impl Into<String>) -> Self {
        Self::InvalidMetricValue {
            kind,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn restore_failed(
        path: impl Into<PathBuf>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::RestoreFailed {
            path: path.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn batch_item(index: usize, name: impl Into<String>, source: Error) -> Self {
        Self::BatchItem {
            index,
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Errors caused by the caller's input rather than by storage.
    ///
    /// Batch failures report the class of the failing item.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidMetricKind { .. }
            | Self::InvalidMetricValue { .. }
            | Self::InvalidMetricName => true,
            Self::BatchItem { source, .. } => source.is_client_error(),
            _ => false,
        }
    }

    /// The error behind any batch wrapping.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::BatchItem { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
