//! Prometheus export for the proxy.
//!
//! All series live on an owned [`Registry`] constructed at startup and
//! passed to whoever records into it; there is no process-global registry,
//! so tests can build as many isolated instances as they need.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "llamagate";

/// Owned Prometheus metric set for the proxy.
pub struct PrometheusMetrics {
    registry: Registry,

    /// Requests through the proxy, by endpoint, model, and status.
    pub requests_total: IntCounterVec,
    /// End-to-end request duration, by endpoint and model.
    pub request_duration_seconds: HistogramVec,
    /// Time spent waiting in the scheduler queue, by priority tier.
    pub queue_wait_seconds: HistogramVec,
    /// Requests waiting for dispatch, sampled at scrape time.
    pub queue_size: IntGauge,
    /// Requests currently being forwarded, sampled at scrape time.
    pub active_requests: IntGauge,
    /// Configured in-flight bound.
    pub max_concurrent_requests: IntGauge,
    /// Requests rejected at admission.
    pub requests_rejected_total: IntCounter,
    /// Requests that hit the per-request deadline.
    pub requests_timeout_total: IntCounter,
    /// Backend health, 1 = reachable.
    pub backend_healthy: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total requests through the proxy")
                .namespace(NAMESPACE),
            &["endpoint", "model", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request duration in seconds")
                .namespace(NAMESPACE)
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
            &["endpoint", "model"],
        )?;

        let queue_wait_seconds = HistogramVec::new(
            HistogramOpts::new("queue_wait_seconds", "Time spent waiting in the queue")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["priority"],
        )?;

        let queue_size = IntGauge::with_opts(
            Opts::new("queue_size", "Requests currently waiting in the queue")
                .namespace(NAMESPACE),
        )?;

        let active_requests = IntGauge::with_opts(
            Opts::new("active_requests", "Requests currently being forwarded")
                .namespace(NAMESPACE),
        )?;

        let max_concurrent_requests = IntGauge::with_opts(
            Opts::new("max_concurrent_requests", "Configured in-flight bound")
                .namespace(NAMESPACE),
        )?;

        let requests_rejected_total = IntCounter::with_opts(
            Opts::new("requests_rejected_total", "Requests rejected at admission")
                .namespace(NAMESPACE),
        )?;

        let requests_timeout_total = IntCounter::with_opts(
            Opts::new("requests_timeout_total", "Requests that timed out")
                .namespace(NAMESPACE),
        )?;

        let backend_healthy = IntGauge::with_opts(
            Opts::new("backend_healthy", "Backend health (1=healthy, 0=unhealthy)")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(queue_wait_seconds.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(max_concurrent_requests.clone()))?;
        registry.register(Box::new(requests_rejected_total.clone()))?;
        registry.register(Box::new(requests_timeout_total.clone()))?;
        registry.register(Box::new(backend_healthy.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            queue_wait_seconds,
            queue_size,
            active_requests,
            max_concurrent_requests,
            requests_rejected_total,
            requests_timeout_total,
            backend_healthy,
        })
    }

    /// Record one completed HTTP request.
    pub fn record_request(&self, endpoint: &str, model: &str, status: u16, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[endpoint, model, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[endpoint, model])
            .observe(duration_secs);
    }

    /// Encode all series to the Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| format!("# error encoding metrics: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_isolated_per_instance() {
        // Two instances must not collide; the registry is owned, not global
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();

        a.record_request("/api/generate", "llama3.2:3b", 200, 0.5);
        assert_eq!(b.requests_total.with_label_values(&["/api/generate", "llama3.2:3b", "200"]).get(), 0);
    }

    #[test]
    fn test_encode_contains_namespace() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_request("/api/chat", "mistral:7b", 200, 1.2);
        metrics.queue_size.set(3);

        let text = metrics.encode();
        assert!(text.contains("llamagate_requests_total"));
        assert!(text.contains("llamagate_queue_size 3"));
    }

    #[test]
    fn test_rejection_and_timeout_counters() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.requests_rejected_total.inc();
        metrics.requests_timeout_total.inc();
        assert_eq!(metrics.requests_rejected_total.get(), 1);
        assert_eq!(metrics.requests_timeout_total.get(), 1);
    }
}
