//! Route handlers.

use {
    axum::{
        Json,
        body::Bytes,
        extract::{Path, State},
        http::StatusCode,
        response::{Html, IntoResponse},
    },
    serde::Deserialize,
    tracing::{debug, warn},
};

use tally_storage::{Metric, MetricKind};

use crate::{
    error::{ApiError, BAD_REQUEST, INVALID_TYPE, NOT_FOUND},
    server::AppState,
    status_page,
};

/// Body of `POST /value/`.
#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "rejected request body");
        ApiError::BadRequest(BAD_REQUEST)
    })
}

fn parse_kind(raw: &str) -> Result<MetricKind, ApiError> {
    raw.parse().map_err(|_| ApiError::BadRequest(INVALID_TYPE))
}

/// `POST /update/{type}/{name}/{value}`
pub async fn update_from_path(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .metrics
        .update(&name, &kind, &value)
        .await
        .map_err(|e| ApiError::from_update(&e))?;
    Ok(StatusCode::OK)
}

/// `POST /update/` with a JSON `Metric`; answers with the stored record.
pub async fn update_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Metric>, ApiError> {
    let metric: Metric = parse_json(&body)?;
    let stored = state
        .metrics
        .update_metric(metric)
        .await
        .map_err(|e| ApiError::from_update(&e))?;
    Ok(Json(stored))
}

/// `POST /updates/` with a JSON array of `Metric`.
pub async fn update_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let metrics: Vec<Metric> = parse_json(&body)?;
    let count = metrics.len();
    state.metrics.update_batch(metrics).await.map_err(|e| {
        warn!(error = %e, count, "metric batch rejected");
        ApiError::from_update(&e)
    })?;
    debug!(count, "metric batch accepted");
    Ok(StatusCode::OK)
}

/// `GET /value/{type}/{name}`: the rendered value as plain text.
pub async fn value_from_path(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let kind = parse_kind(&kind)?;
    state
        .metrics
        .value(&name, kind)
        .await
        .map_err(|e| ApiError::from_read(&e))?
        .ok_or(ApiError::NotFound(NOT_FOUND))
}

/// `POST /value/` with `{"id", "type"}`.
pub async fn value_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Metric>, ApiError> {
    let query: MetricQuery = parse_json(&body)?;
    let kind = parse_kind(&query.kind)?;
    state
        .metrics
        .metric(&query.id, kind)
        .await
        .map_err(|e| ApiError::from_read(&e))?
        .map(Json)
        .ok_or(ApiError::NotFound(NOT_FOUND))
}

/// `GET /`
pub async fn index(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let snapshot = state
        .metrics
        .all()
        .await
        .map_err(|e| ApiError::from_read(&e))?;
    Ok(Html(status_page::render(&snapshot)))
}

/// `GET /ping`
pub async fn ping(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.health_check().await {
        Ok(()) => (StatusCode::OK, "pong"),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        },
    }
}
