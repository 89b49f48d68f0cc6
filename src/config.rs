//! Proxy configuration, loaded from environment variables before the
//! scheduler starts.

use std::time::Duration;

use crate::error::ProxyError;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the proxy listens on
    pub port: u16,

    /// Ollama backend URL
    pub ollama_url: String,

    /// Maximum requests waiting in the scheduler queue
    pub max_queue_size: usize,

    /// Maximum concurrent requests forwarded to Ollama
    pub max_concurrency: usize,

    /// Per-request deadline covering the whole upstream exchange
    pub request_timeout: Duration,

    /// Rolling sample window for percentile telemetry
    pub sample_window: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 11435,
            ollama_url: "http://localhost:11434".to_string(),
            max_queue_size: 100,
            max_concurrency: 10,
            request_timeout: Duration::from_secs(300),
            sample_window: crate::metrics::recorder::DEFAULT_SAMPLE_WINDOW,
        }
    }
}

impl ProxyConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("LLAMAGATE_PORT").unwrap_or(defaults.port),
            ollama_url: std::env::var("OLLAMA_HOST")
                .or_else(|_| std::env::var("OLLAMA_URL"))
                .unwrap_or(defaults.ollama_url),
            max_queue_size: env_parse("MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            max_concurrency: env_parse("MAX_CONCURRENCY").unwrap_or(defaults.max_concurrency),
            request_timeout: env_parse("REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            sample_window: env_parse("LLAMAGATE_SAMPLE_WINDOW").unwrap_or(defaults.sample_window),
        }
    }

    /// Check the configuration before starting the scheduler.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_queue_size == 0 {
            return Err(ProxyError::InvalidRequest(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ProxyError::InvalidRequest(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ProxyError::InvalidRequest(
                "request_timeout must be non-zero".to_string(),
            ));
        }
        if self.sample_window == 0 {
            return Err(ProxyError::InvalidRequest(
                "sample_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 11435);
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let mut config = ProxyConfig::default();
        config.max_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
