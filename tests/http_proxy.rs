//! End-to-end tests: the proxy on a real socket in front of a mock Ollama
//! backend, driven over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use llamagate::{app, AppState, ProxyConfig};

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn proxy_over(backend: SocketAddr, request_timeout: Duration) -> SocketAddr {
    let config = ProxyConfig {
        port: 0,
        ollama_url: format!("http://{backend}"),
        max_queue_size: 8,
        max_concurrency: 2,
        request_timeout,
        sample_window: 64,
    };
    let state = Arc::new(AppState::new(config).unwrap());
    serve(app(state)).await
}

async fn streaming_generate() -> Response {
    let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
        Ok(bytes::Bytes::from_static(b"{\"response\":\"hel\"}\n")),
        Ok(bytes::Bytes::from_static(b"{\"response\":\"lo\",\"done\":true}\n")),
    ];
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

#[tokio::test]
async fn test_generate_streams_end_to_end() {
    let backend = serve(Router::new().route("/api/generate", post(streaming_generate))).await;
    let proxy = proxy_over(backend, Duration::from_secs(5)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{proxy}/api/generate"))
        .header("X-Priority", "high")
        .json(&json!({"model": "llama3.2:3b", "prompt": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .contains("ndjson"));
    let body = response.text().await.unwrap();
    assert!(body.contains("\"response\":\"hel\""));
    assert!(body.contains("\"done\":true"));

    // The request was scheduled on the high tier
    let metrics: Value = reqwest::get(format!("http://{proxy}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["tiers"]["high"]["received"], 1);
    assert_eq!(metrics["tiers"]["normal"]["received"], 0);
}

#[tokio::test]
async fn test_upstream_error_maps_to_bad_gateway() {
    let failing = || async { (StatusCode::INTERNAL_SERVER_ERROR, "model exploded").into_response() };
    let backend = serve(Router::new().route("/api/chat", post(failing))).await;
    let proxy = proxy_over(backend, Duration::from_secs(5)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{proxy}/api/chat"))
        .json(&json!({"model": "mistral:7b", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("500"));
}

#[tokio::test]
async fn test_upstream_timeout_maps_to_gateway_timeout() {
    let slow = || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Json(json!({"done": true})).into_response()
    };
    let backend = serve(Router::new().route("/api/generate", post(slow))).await;
    let proxy = proxy_over(backend, Duration::from_millis(200)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{proxy}/api/generate"))
        .json(&json!({"model": "llama3.2:3b", "prompt": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "timed_out");
}

#[tokio::test]
async fn test_unscheduled_endpoints_pass_through() {
    let backend = serve(
        Router::new()
            .route("/api/tags", get(|| async { Json(json!({"models": []})) }))
            .route("/api/version", get(|| async { Json(json!({"version": "0.6.0"})) })),
    )
    .await;
    let proxy = proxy_over(backend, Duration::from_secs(5)).await;

    let tags: Value = reqwest::get(format!("http://{proxy}/api/tags"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tags, json!({"models": []}));

    // Endpoints without a dedicated route go through the fallback
    let version: Value = reqwest::get(format!("http://{proxy}/api/version"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["version"], "0.6.0");

    let health = reqwest::get(format!("http://{proxy}/health")).await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}
