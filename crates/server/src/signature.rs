//! `HashSHA256` request verification and response signing.

use {
    axum::{
        body::{Body, to_bytes},
        extract::{Request, State},
        http::{HeaderName, HeaderValue},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    tracing::{error, warn},
};

use tally_common::SigningKey;

use crate::{
    error::{ApiError, BAD_REQUEST},
    server::AppState,
};

const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("hashsha256");

/// Largest body the signature check will buffer.
pub const MAX_SIGNED_BODY: usize = 16 * 1024 * 1024;

/// Reject requests whose body does not match the `HashSHA256` header and
/// sign the response body. A no-op when no key is configured.
pub async fn verify_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = state.signing_key.clone() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let Some(signature) = parts
        .headers
        .get(&SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        warn!(path = %parts.uri.path(), "request without signature");
        return ApiError::BadRequest(BAD_REQUEST).into_response();
    };

    let bytes = match to_bytes(body, MAX_SIGNED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read signed body");
            return ApiError::BadRequest(BAD_REQUEST).into_response();
        },
    };
    if let Err(e) = key.verify(&bytes, &signature) {
        warn!(path = %parts.uri.path(), error = %e, "signature check failed");
        return ApiError::BadRequest(BAD_REQUEST).into_response();
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    sign_response(&key, response).await
}

async fn sign_response(key: &SigningKey, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to buffer response for signing");
            return ApiError::Internal("failed to sign response").into_response();
        },
    };
    if let Ok(value) = HeaderValue::from_str(&key.sign(&bytes)) {
        parts.headers.insert(SIGNATURE_HEADER, value);
    }
    Response::from_parts(parts, Body::from(bytes))
}
