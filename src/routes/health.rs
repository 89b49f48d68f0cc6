//! Health probes and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::{debug, warn};

use crate::state::AppState;

/// Prometheus text exposition content type.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Handle GET /health
///
/// Probes the backend so the answer reflects the whole path, not just the
/// proxy process.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = match state.upstream.health_check().await {
        Ok(()) => {
            state.prometheus.backend_healthy.set(1);
            "healthy"
        }
        Err(e) => {
            warn!(error = %e, "backend health check failed");
            state.prometheus.backend_healthy.set(0);
            "unreachable"
        }
    };

    let status = if backend == "healthy" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if backend == "healthy" { "healthy" } else { "degraded" },
            "backend": {
                "url": state.upstream.base_url(),
                "status": backend,
            },
            "scheduler": {
                "queue_depth": state.scheduler.queue_depth(),
                "in_flight": state.scheduler.in_flight(),
            },
        })),
    )
}

/// Handle GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.upstream.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({"ready": true}))),
        Err(e) => {
            debug!(error = %e, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ready": false})))
        }
    }
}

/// Handle GET /live
pub async fn live() -> impl IntoResponse {
    Json(json!({"alive": true}))
}

/// Handle GET /metrics
///
/// JSON view of the scheduler counters and latency percentiles, with the
/// live queue gauges alongside so one scrape tells the whole story.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.recorder.snapshot();

    Json(json!({
        "queue": {
            "depth": state.scheduler.queue_depth(),
            "in_flight": state.scheduler.in_flight(),
            "max_queue_size": state.config.max_queue_size,
            "max_concurrency": state.config.max_concurrency,
        },
        "tiers": {
            "normal": snapshot.normal,
            "high": snapshot.high,
        },
        "combined": {
            "wait_ms": snapshot.combined_wait,
            "service_ms": snapshot.combined_service,
        },
    }))
}

/// Handle GET /metrics/prometheus
pub async fn metrics_prometheus(State(state): State<Arc<AppState>>) -> Response {
    // Gauges are sampled at scrape time rather than tracked on every
    // scheduler transition.
    state
        .prometheus
        .queue_size
        .set(state.scheduler.queue_depth() as i64);
    state
        .prometheus
        .active_requests
        .set(state.scheduler.in_flight() as i64);

    (
        [(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.prometheus.encode(),
    )
        .into_response()
}
