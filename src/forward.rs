//! Upstream forwarding for admitted requests.
//!
//! [`OllamaForwarder`] executes one scheduled request against the backend
//! and relays the response chunk by chunk; inference responses can be large
//! and token-streamed, so the full payload is never buffered. The
//! [`Forward`] trait is the seam that lets scheduler tests run against a
//! mock backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::error::ProxyError;
use crate::scheduler::request::{Outcome, OutcomeKind, ProxyPayload, ReplySlot, UpstreamStream};

/// Capacity of the relay channel between the dispatch worker and the
/// caller's response body. Small: it only smooths bursts, the backend
/// paces the stream.
const RELAY_BUFFER_CHUNKS: usize = 32;

/// Executes one admitted request and delivers its outcome exactly once.
///
/// Implementations must return only after the request is fully serviced;
/// the dispatcher holds the concurrency slot for the duration of the call.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, payload: ProxyPayload, reply: ReplySlot) -> OutcomeKind;
}

/// Production forwarder over the configured Ollama backend.
pub struct OllamaForwarder {
    client: Client,
    base_url: String,
}

impl OllamaForwarder {
    /// Create a forwarder with a per-request timeout covering the whole
    /// exchange, connect through last body byte.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ProxyError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check whether Ollama answers on `/api/tags`.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), ProxyError> {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status().as_u16();
                let message = response.text().await.unwrap_or_default();
                Err(ProxyError::Upstream { status, message })
            }
            Err(e) => Err(ProxyError::UpstreamConnection(e.to_string())),
        }
    }

    /// Forward a request to Ollama outside the scheduler, for unscheduled
    /// endpoints such as `/api/tags` and the catch-all passthrough.
    #[instrument(skip(self, body))]
    pub async fn forward_raw(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Bytes>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "forwarding raw request");

        let mut builder = self.client.request(method, &url);
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        Ok(response)
    }
}

#[async_trait]
impl Forward for OllamaForwarder {
    #[instrument(skip(self, payload, reply), fields(path = %payload.path, model = %payload.model))]
    async fn forward(&self, payload: ProxyPayload, reply: ReplySlot) -> OutcomeKind {
        let url = format!("{}{}", self.base_url, payload.path);

        let response = match self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "upstream request timed out");
                reply.deliver(Outcome::TimedOut);
                return OutcomeKind::TimedOut;
            }
            Err(e) => {
                error!(error = %e, "failed to reach upstream");
                reply.deliver(Outcome::UpstreamError {
                    status: e.status().map(|s| s.as_u16()),
                    message: e.to_string(),
                });
                return OutcomeKind::UpstreamError;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "upstream returned error status");
            reply.deliver(Outcome::UpstreamError {
                status: Some(status.as_u16()),
                message,
            });
            return OutcomeKind::UpstreamError;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let (tx, rx) = mpsc::channel(RELAY_BUFFER_CHUNKS);
        let delivered = reply.deliver(Outcome::Stream(UpstreamStream {
            status: status.as_u16(),
            content_type,
            chunks: rx,
        }));
        if !delivered {
            // Caller hung up between dispatch and the upstream answer;
            // dropping the response releases the backend connection.
            debug!("caller gone before stream start");
            return OutcomeKind::Cancelled;
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        debug!("caller hung up mid-stream, aborting relay");
                        break;
                    }
                }
                Err(e) => {
                    let timed_out = e.is_timeout();
                    warn!(error = %e, "upstream stream failed");
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    return if timed_out {
                        OutcomeKind::TimedOut
                    } else {
                        OutcomeKind::UpstreamError
                    };
                }
            }
        }

        OutcomeKind::Ok
    }
}
