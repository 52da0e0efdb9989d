//! Mapping of storage failures onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use {
    tally_storage::{Error as StorageError, MetricKind},
    tracing::error,
};

/// Plain-text error response. Bodies are fixed strings so clients can
/// match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    BadRequest(&'static str),
    NotFound(&'static str),
    Internal(&'static str),
}

pub const BAD_REQUEST: &str = "bad request";
pub const INVALID_TYPE: &str = "invalid metric type";
pub const NOT_FOUND: &str = "metric not found";
pub const UPDATE_FAILED: &str = "failed to update metric";
pub const READ_FAILED: &str = "failed to read metric";

impl ApiError {
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::BadRequest(m) | Self::NotFound(m) | Self::Internal(m) => m,
        }
    }

    /// Classify a failed write.
    pub fn from_update(err: &StorageError) -> Self {
        match err.root() {
            StorageError::InvalidMetricKind { .. } => Self::BadRequest(INVALID_TYPE),
            StorageError::InvalidMetricValue {
                kind: MetricKind::Counter,
                ..
            } => Self::BadRequest("invalid counter value"),
            StorageError::InvalidMetricValue {
                kind: MetricKind::Gauge,
                ..
            } => Self::BadRequest("invalid gauge value"),
            StorageError::InvalidMetricName => Self::NotFound(NOT_FOUND),
            _ => {
                error!(error = %err, "metric update failed");
                Self::Internal(UPDATE_FAILED)
            },
        }
    }

    /// Classify a failed read.
    pub fn from_read(err: &StorageError) -> Self {
        error!(error = %err, "metric read failed");
        Self::Internal(READ_FAILED)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.message()).into_response()
    }
}
