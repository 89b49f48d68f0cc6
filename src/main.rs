//! llamagate - monitoring reverse proxy for local LLM inference.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamagate::ProxyConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("llamagate=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load configuration
    let config = ProxyConfig::from_env();

    info!(
        port = config.port,
        ollama_url = %config.ollama_url,
        max_queue_size = config.max_queue_size,
        max_concurrency = config.max_concurrency,
        "Starting llamagate v{}",
        env!("CARGO_PKG_VERSION")
    );

    println!();
    println!("==================================================");
    println!("  llamagate v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://0.0.0.0:{}", config.port);
    println!("  Ollama backend: {}", config.ollama_url);
    println!();
    println!("  Scheduler configuration:");
    println!("    Max concurrent: {}", config.max_concurrency);
    println!("    Max queue: {}", config.max_queue_size);
    println!("    Request timeout: {}s", config.request_timeout.as_secs());
    println!();
    println!("  Endpoints:");
    println!("    Inference: POST /api/generate, POST /api/chat");
    println!("    Models:    GET  /api/tags");
    println!("    Health:    GET  /health, /ready, /live");
    println!("    Metrics:   GET  /metrics, /metrics/prometheus");
    println!();
    println!("  Priority: send \"X-Priority: high\" to jump the queue");
    println!("==================================================");
    println!();

    llamagate::run_server(config).await
}
