//! End-to-end tests for the metrics HTTP API.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    io::{Read, Write},
    net::SocketAddr,
};

use {
    flate2::{Compression, read::GzDecoder, write::GzEncoder},
    reqwest::StatusCode,
    secrecy::Secret,
    tokio::{net::TcpListener, sync::oneshot},
};

use {
    tally_common::SigningKey,
    tally_config::StorageConfig,
    tally_server::{build_app, serve},
    tally_storage::{Metric, MetricKind, MetricsService},
};

const KEY: &str = "test-secret";

fn signing_key() -> SigningKey {
    SigningKey::new(Secret::new(KEY.to_string()))
}

/// Start a server on an ephemeral port and return its base URL.
async fn start_server(metrics: MetricsService, key: Option<SigningKey>) -> String {
    let app = build_app(metrics, key);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn post(url: &str) -> (StatusCode, String) {
    let resp = reqwest::Client::new().post(url).send().await.unwrap();
    (resp.status(), resp.text().await.unwrap())
}

async fn get(url: &str) -> (StatusCode, String) {
    let resp = reqwest::get(url).await.unwrap();
    (resp.status(), resp.text().await.unwrap())
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[tokio::test]
async fn path_updates_accumulate_counters_and_replace_gauges() {
    let base = start_server(MetricsService::in_memory(), None).await;

    assert_eq!(post(&format!("{base}/update/counter/requests/5")).await.0, StatusCode::OK);
    assert_eq!(post(&format!("{base}/update/counter/requests/3")).await.0, StatusCode::OK);
    post(&format!("{base}/update/gauge/temp/36.6")).await;
    post(&format!("{base}/update/gauge/temp/37.1")).await;

    assert_eq!(
        get(&format!("{base}/value/counter/requests")).await,
        (StatusCode::OK, "8".to_string())
    );
    assert_eq!(
        get(&format!("{base}/value/gauge/temp")).await,
        (StatusCode::OK, "37.1".to_string())
    );
}

#[tokio::test]
async fn path_update_rejects_bad_input() {
    let base = start_server(MetricsService::in_memory(), None).await;

    assert_eq!(
        post(&format!("{base}/update/histogram/x/1")).await,
        (StatusCode::BAD_REQUEST, "invalid metric type".to_string())
    );
    assert_eq!(
        post(&format!("{base}/update/counter/x/1.5")).await,
        (StatusCode::BAD_REQUEST, "invalid counter value".to_string())
    );
    assert_eq!(
        post(&format!("{base}/update/gauge/x/abc")).await,
        (StatusCode::BAD_REQUEST, "invalid gauge value".to_string())
    );
    assert_eq!(
        post(&format!("{base}/update/counter//5")).await.0,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn unknown_value_is_not_found() {
    let base = start_server(MetricsService::in_memory(), None).await;

    assert_eq!(
        get(&format!("{base}/value/gauge/missing")).await,
        (StatusCode::NOT_FOUND, "metric not found".to_string())
    );
    assert_eq!(
        get(&format!("{base}/value/timer/missing")).await.0,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn json_update_and_value() {
    let base = start_server(MetricsService::in_memory(), None).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/update/"))
        .json(&Metric::counter("PollCount", 2))
        .send()
        .await
        .unwrap();
    let stored: Metric = client
        .post(format!("{base}/update/"))
        .json(&Metric::counter("PollCount", 3))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored, Metric::counter("PollCount", 5));

    let resp = client
        .post(format!("{base}/value/"))
        .json(&serde_json::json!({"id": "PollCount", "type": "counter"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json::<Metric>().await.unwrap(), Metric::counter("PollCount", 5));

    let resp = client
        .post(format!("{base}/value/"))
        .json(&serde_json::json!({"id": "PollCount", "type": "gauge"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("{base}/update/"))
        .body(r#"{"id":"Alloc","type":"gauge"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_update_is_validated_up_front() {
    let metrics = MetricsService::in_memory();
    let base = start_server(metrics.clone(), None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/updates/"))
        .body("[{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "bad request");

    let resp = client
        .post(format!("{base}/updates/"))
        .body(r#"[{"id":"x","type":"counter","delta":1},{"id":"y","type":"counter","value":1.0}]"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(metrics.value("x", MetricKind::Counter).await.unwrap(), None);

    let resp = client
        .post(format!("{base}/updates/"))
        .json(&vec![
            Metric::counter("x", 1),
            Metric::counter("x", 2),
            Metric::gauge("y", 0.5),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        metrics.value("x", MetricKind::Counter).await.unwrap(),
        Some("3".to_string())
    );
}

#[tokio::test]
async fn gzip_request_bodies_are_accepted() {
    let metrics = MetricsService::in_memory();
    let base = start_server(metrics.clone(), None).await;
    let body = serde_json::to_vec(&vec![Metric::gauge("RandomValue", 0.75)]).unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{base}/updates/"))
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .body(gzip(&body))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        metrics.value("RandomValue", MetricKind::Gauge).await.unwrap(),
        Some("0.75".to_string())
    );
}

#[tokio::test]
async fn status_page_is_compressed_on_request() {
    let metrics = MetricsService::in_memory();
    metrics.update("PollCount", "counter", "7").await.unwrap();
    metrics.update("TotalMemory", "gauge", "16384").await.unwrap();
    let base = start_server(metrics, None).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/"))
        .header("Accept-Encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-encoding"], "gzip");
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );

    let compressed = resp.bytes().await.unwrap();
    let mut html = String::new();
    GzDecoder::new(&compressed[..]).read_to_string(&mut html).unwrap();
    assert!(html.contains("PollCount"));
    assert!(html.contains("TotalMemory"));
}

#[tokio::test]
async fn signed_batches() {
    let metrics = MetricsService::in_memory();
    let base = start_server(metrics.clone(), Some(signing_key())).await;
    let client = reqwest::Client::new();
    let body = serde_json::to_vec(&vec![Metric::counter("PollCount", 4)]).unwrap();

    let resp = client
        .post(format!("{base}/updates/"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("{base}/updates/"))
        .header("HashSHA256", SigningKey::new(Secret::new("other".into())).sign(&body))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(metrics.value("PollCount", MetricKind::Counter).await.unwrap(), None);

    let resp = client
        .post(format!("{base}/updates/"))
        .header("HashSHA256", signing_key().sign(&body))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let response_sig = resp.headers()["hashsha256"].to_str().unwrap().to_string();
    let response_body = resp.bytes().await.unwrap();
    signing_key().verify(&response_body, &response_sig).unwrap();

    // Signing covers the decompressed body.
    let resp = client
        .post(format!("{base}/updates/"))
        .header("HashSHA256", signing_key().sign(&body))
        .header("Content-Encoding", "gzip")
        .body(gzip(&body))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        metrics.value("PollCount", MetricKind::Counter).await.unwrap(),
        Some("8".to_string())
    );

    // Only the batch route is guarded.
    assert_eq!(
        post(&format!("{base}/update/counter/PollCount/1")).await.0,
        StatusCode::OK
    );
}

#[tokio::test]
async fn ping_reports_storage_health() {
    let metrics = MetricsService::in_memory();
    let base = start_server(metrics.clone(), None).await;

    assert_eq!(
        get(&format!("{base}/ping")).await,
        (StatusCode::OK, "pong".to_string())
    );

    metrics.close().await.unwrap();
    assert_eq!(
        get(&format!("{base}/ping")).await.0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        post(&format!("{base}/update/counter/x/1")).await,
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to update metric".to_string()
        )
    );
}

#[tokio::test]
async fn graceful_shutdown_flushes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.json");
    let cfg = StorageConfig {
        file_storage_path: Some(path.clone()),
        store_interval: 0,
        ..StorageConfig::default()
    };
    let metrics = MetricsService::from_config(&cfg).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, metrics.clone(), None, async move {
        let _ = stop_rx.await;
    }));

    post(&format!("{base}/update/counter/PollCount/3")).await;
    assert!(!path.exists());

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();

    let on_disk: Vec<Metric> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(on_disk, vec![Metric::counter("PollCount", 3)]);

    let restored = MetricsService::from_config(&cfg).await.unwrap();
    assert_eq!(
        restored.value("PollCount", MetricKind::Counter).await.unwrap(),
        Some("3".to_string())
    );
}
