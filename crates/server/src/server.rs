use std::{future::Future, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        middleware::from_fn_with_state,
        routing::{get, post},
    },
    tokio::net::TcpListener,
    tower_http::{
        compression::CompressionLayer, decompression::RequestDecompressionLayer,
        trace::TraceLayer,
    },
    tracing::info,
};

use {
    tally_common::{SigningKey, shutdown_signal},
    tally_config::TallyConfig,
    tally_storage::MetricsService,
};

use crate::{handlers, signature::verify_signature};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub metrics: MetricsService,
    pub signing_key: Option<Arc<SigningKey>>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the router (shared between production startup and tests).
pub fn build_app(metrics: MetricsService, signing_key: Option<SigningKey>) -> Router {
    let state = AppState {
        metrics,
        signing_key: signing_key.map(Arc::new),
    };

    Router::new()
        .route("/", get(handlers::index))
        .route("/ping", get(handlers::ping))
        .route("/update/", post(handlers::update_json))
        .route(
            "/update/{type}/{name}/{value}",
            post(handlers::update_from_path),
        )
        .route(
            "/updates/",
            post(handlers::update_batch)
                .route_layer(from_fn_with_state(state.clone(), verify_signature)),
        )
        .route("/value/", post(handlers::value_json))
        .route("/value/{type}/{name}", get(handlers::value_from_path))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close the store.
pub async fn serve(
    listener: TcpListener,
    metrics: MetricsService,
    signing_key: Option<SigningKey>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_app(metrics.clone(), signing_key);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")?;

    info!("http server stopped, closing metrics store");
    metrics.close().await.context("failed to close metrics store")?;
    Ok(())
}

/// Open the configured store, bind, and serve until Ctrl-C or SIGTERM.
pub async fn run(config: &TallyConfig) -> anyhow::Result<()> {
    let metrics = MetricsService::from_config(&config.storage)
        .await
        .context("failed to open metrics store")?;
    let signing_key = SigningKey::from_optional(config.server.key.as_ref());

    let listener = TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.address))?;
    info!(
        address = %listener.local_addr()?,
        backend = metrics.backend_name(),
        signed = signing_key.is_some(),
        "metrics server listening"
    );

    serve(listener, metrics, signing_key, shutdown_signal()).await
}
