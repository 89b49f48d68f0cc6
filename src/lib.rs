//! llamagate - monitoring reverse proxy for local LLM inference.
//!
//! Sits between your application and Ollama, providing:
//! - Priority-aware request scheduling with bounded concurrency
//! - Hard admission control when the queue is full
//! - Queue wait and service latency percentiles per priority tier
//! - Prometheus metrics
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (port 11435, Ollama at localhost:11434)
//! llamagate
//!
//! # Custom configuration
//! OLLAMA_HOST=http://192.168.1.100:11434 LLAMAGATE_PORT=9000 llamagate
//! ```
//!
//! Mark a request urgent with the `X-Priority: high` header; everything
//! else is scheduled at normal priority.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod config;
pub mod error;
pub mod forward;
pub mod metrics;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use state::AppState;

/// Build the proxy router over shared state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/health", get(routes::health::health))
        .route("/ready", get(routes::health::ready))
        .route("/live", get(routes::health::live))
        .route("/metrics", get(routes::health::metrics))
        .route("/metrics/prometheus", get(routes::health::metrics_prometheus))
        // Scheduled inference endpoints
        .route("/api/generate", post(routes::ollama::generate))
        .route("/api/chat", post(routes::ollama::chat))
        // Unscheduled Ollama endpoints
        .route("/api/tags", get(routes::ollama::tags))
        .fallback(routes::ollama::passthrough)
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the proxy server.
///
/// Blocks until SIGINT, then drains the scheduler before returning:
/// queued requests are rejected, in-flight requests finish.
pub async fn run_server(config: ProxyConfig) -> anyhow::Result<()> {
    config.validate()?;

    let state = Arc::new(AppState::new(config.clone())?);

    // Check Ollama connectivity
    match state.upstream.health_check().await {
        Ok(()) => {
            state.prometheus.backend_healthy.set(1);
            info!("Connected to Ollama at {}", config.ollama_url);
        }
        Err(e) => {
            state.prometheus.backend_healthy.set(0);
            warn!(
                "Could not connect to Ollama at {}: {}. \
                 Proxy will start anyway and retry on requests.",
                config.ollama_url, e
            );
        }
    }

    let app = app(Arc::clone(&state));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("llamagate listening on http://{}", addr);
    info!("Ollama API: http://{}/api/chat", addr);
    info!("Health:     http://{}/health", addr);
    info!("Metrics:    http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining scheduler");
    state.scheduler.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
