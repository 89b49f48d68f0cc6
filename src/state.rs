//! Application state shared across all handlers.

use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forward::{Forward, OllamaForwarder};
use crate::metrics::{MetricsRecorder, PrometheusMetrics};
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Application state shared across all handlers
pub struct AppState {
    /// Configuration
    pub config: ProxyConfig,

    /// Upstream client, used for scheduled forwards and raw passthrough
    pub upstream: Arc<OllamaForwarder>,

    /// Priority-aware request scheduler
    pub scheduler: Scheduler,

    /// Scheduler timing telemetry
    pub recorder: Arc<MetricsRecorder>,

    /// Prometheus export
    pub prometheus: Arc<PrometheusMetrics>,
}

impl AppState {
    /// Wire the metrics, forwarder, and scheduler together and start the
    /// dispatch workers.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let prometheus = Arc::new(
            PrometheusMetrics::new()
                .map_err(|e| ProxyError::Internal(format!("metrics registration failed: {e}")))?,
        );
        prometheus
            .max_concurrent_requests
            .set(config.max_concurrency as i64);

        let recorder = Arc::new(
            MetricsRecorder::new(config.sample_window).with_exporter(Arc::clone(&prometheus)),
        );

        let upstream = Arc::new(OllamaForwarder::new(
            &config.ollama_url,
            config.request_timeout,
        )?);

        let scheduler = Scheduler::start(
            SchedulerConfig {
                max_queue_size: config.max_queue_size,
                max_concurrency: config.max_concurrency,
            },
            Arc::clone(&upstream) as Arc<dyn Forward>,
            Arc::clone(&recorder),
        );

        Ok(Self { config, upstream, scheduler, recorder, prometheus })
    }
}
