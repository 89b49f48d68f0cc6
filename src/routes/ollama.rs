//! Inference endpoints.
//!
//! `/api/generate` and `/api/chat` go through the scheduler; everything
//! else is forwarded to Ollama as-is.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::error::ProxyError;
use crate::scheduler::{EnqueueError, Outcome, Priority, ProxyPayload, RejectReason};
use crate::state::AppState;

/// Request header carrying the priority marker.
const PRIORITY_HEADER: &str = "x-priority";

/// Content type Ollama uses for streamed inference responses.
const NDJSON: &str = "application/x-ndjson";

/// Handle POST /api/generate
#[instrument(skip(state, headers, body))]
pub async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    scheduled(state, "/api/generate", &headers, body).await
}

/// Handle POST /api/chat
#[instrument(skip(state, headers, body))]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    scheduled(state, "/api/chat", &headers, body).await
}

/// Handle GET /api/tags, forwarded directly without scheduling
#[instrument(skip(state))]
pub async fn tags(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let response = state
        .upstream
        .forward_raw(reqwest::Method::GET, "/api/tags", None, None)
        .await?;
    relay_response(response)
}

/// Catch-all passthrough for Ollama endpoints the proxy does not schedule
/// (model management, embeddings, version).
#[instrument(skip(state, request), fields(path = %request.uri().path()))]
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;
    let body = (!bytes.is_empty()).then_some(bytes);

    debug!(method = %parts.method, path = %path, "passthrough");

    let response = state
        .upstream
        .forward_raw(parts.method, &path, body, content_type.as_deref())
        .await?;
    relay_response(response)
}

/// Run one request through the scheduler and turn its outcome into an HTTP
/// response.
async fn scheduled(
    state: Arc<AppState>,
    endpoint: &'static str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let priority = Priority::from_marker(
        headers
            .get(PRIORITY_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let model = extract_model(&body);
    let started = Instant::now();

    info!(endpoint, model = %model, priority = priority.as_str(), "request received");

    let ticket = state
        .scheduler
        .enqueue(
            ProxyPayload { path: endpoint.to_string(), body, model: model.clone() },
            priority,
        )
        .map_err(|e| {
            warn!(endpoint, error = %e, "request rejected at admission");
            state.prometheus.record_request(endpoint, &model, 503, started.elapsed().as_secs_f64());
            match e {
                EnqueueError::QueueFull { max } => ProxyError::QueueFull(max),
                EnqueueError::ShuttingDown => ProxyError::ShuttingDown,
            }
        })?;

    match ticket.wait().await {
        Outcome::Stream(upstream) => {
            state.prometheus.record_request(
                endpoint,
                &model,
                upstream.status,
                started.elapsed().as_secs_f64(),
            );
            let content_type = upstream.content_type.unwrap_or_else(|| NDJSON.to_string());
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
            Response::builder()
                .status(status)
                .header(CONTENT_TYPE, content_type)
                .body(Body::from_stream(ReceiverStream::new(upstream.chunks)))
                .map_err(|e| ProxyError::Internal(format!("failed to build response: {e}")))
        }
        Outcome::UpstreamError { status, message } => {
            let recorded = status.unwrap_or(502);
            state.prometheus.record_request(endpoint, &model, recorded, started.elapsed().as_secs_f64());
            Err(match status {
                Some(status) => ProxyError::Upstream { status, message },
                None => ProxyError::UpstreamConnection(message),
            })
        }
        Outcome::TimedOut => {
            state.prometheus.record_request(endpoint, &model, 504, started.elapsed().as_secs_f64());
            Err(ProxyError::TimedOut)
        }
        Outcome::Rejected(RejectReason::QueueFull) => {
            state.prometheus.record_request(endpoint, &model, 503, started.elapsed().as_secs_f64());
            Err(ProxyError::QueueFull(state.config.max_queue_size))
        }
        Outcome::Rejected(RejectReason::ShuttingDown) => {
            state.prometheus.record_request(endpoint, &model, 503, started.elapsed().as_secs_f64());
            Err(ProxyError::ShuttingDown)
        }
    }
}

/// Pull the model name out of a request body for telemetry labels.
///
/// Unparseable bodies are still forwarded; the backend is the authority on
/// what it accepts.
fn extract_model(body: &Bytes) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Stream an unscheduled upstream response back to the caller.
fn relay_response(response: reqwest::Response) -> Result<Response, ProxyError> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    use futures::TryStreamExt;
    let stream = response.bytes_stream().map_err(std::io::Error::other);

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .map_err(|e| ProxyError::Internal(format!("failed to build response: {e}")))
}
