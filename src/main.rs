//! Magic Aggregator - request-scoped metric aggregation service
//!
//! Accepts metric fragments over HTTP, accumulates them per request
//! identifier, and forwards each request's batch downstream once all of its
//! declared fragments have arrived.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables (see `config`):
//!
//! - `MAGIC_LISTEN_ADDR`: ingress bind address (default: 0.0.0.0:8080)
//! - `MAGIC_EXPORT_MODE`: `log` or `http` (default: log)
//! - `MAGIC_EXPORT_URL`: downstream base URL (default: http://localhost:9090)
//! - `MAGIC_PENDING_TTL_SECS`: pending request lifetime (default: 300)
//! - `MAGIC_MAX_PENDING`: pending request cap (default: 10000)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use magic_aggregator::aggregator::{sweep_task, Aggregator, AggregatorConfig};
use magic_aggregator::config::Config;
use magic_aggregator::consumer;
use magic_aggregator::server::{self, AppState};

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Magic Aggregator service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                component = %config.component_name,
                listen_addr = %config.listen_addr,
                export_mode = %config.export_mode,
                pending_ttl_secs = config.pending_ttl.as_secs(),
                max_pending = config.max_pending,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let consumer = match consumer::from_config(&config) {
        Ok(consumer) => {
            info!(consumer = consumer.name(), "Downstream consumer initialized");
            consumer
        }
        Err(e) => {
            error!(error = %e, "Failed to create downstream consumer");
            std::process::exit(1);
        }
    };

    let aggregator = Arc::new(Aggregator::new(AggregatorConfig::from(&config)));

    let sweep_handle = tokio::spawn(sweep_task(aggregator.clone(), config.sweep_interval));

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.listen_addr, "Failed to bind ingress server");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(aggregator.clone(), consumer));
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    };

    if let Err(e) = server::serve(listener, state, shutdown).await {
        error!(error = %e, "Ingress server error");
    }

    sweep_handle.abort();

    let pending = aggregator.pending_count();
    if pending > 0 {
        info!(pending = pending, "Discarding incomplete requests on shutdown");
    }

    info!("Magic Aggregator stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
