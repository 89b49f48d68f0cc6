//! Error types for the llamagate proxy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to connect to the Ollama backend
    #[error("failed to connect to Ollama: {0}")]
    UpstreamConnection(String),

    /// Ollama returned an error
    #[error("Ollama error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Request parsing error
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Scheduler queue is at capacity
    #[error("request queue is full (max: {0})")]
    QueueFull(usize),

    /// Proxy is shutting down
    #[error("proxy is shutting down")]
    ShuttingDown,

    /// The per-request deadline elapsed
    #[error("request timed out")]
    TimedOut,

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamConnection(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Serialization(_) => StatusCode::BAD_REQUEST,
            ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
            ProxyError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::UpstreamConnection(_) => "upstream_connection",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::Serialization(_) => "serialization",
            ProxyError::Http(_) => "http",
            ProxyError::QueueFull(_) => "queue_full",
            ProxyError::ShuttingDown => "shutting_down",
            ProxyError::TimedOut => "timed_out",
            ProxyError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::QueueFull(100).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyError::TimedOut.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Upstream { status: 500, message: "boom".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_display_includes_backend_status() {
        let err = ProxyError::Upstream { status: 500, message: "internal".into() };
        assert!(err.to_string().contains("500"));
    }
}
