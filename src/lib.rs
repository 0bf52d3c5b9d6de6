//! Magic Aggregator Library
//!
//! Components for request-scoped metric aggregation:
//!
//! - **config**: Environment-based configuration
//! - **metric**: Wire types for fragments and completed batches
//! - **aggregator**: Per-request fragment accumulation with TTL and capacity bounds
//! - **consumer**: Downstream sinks for completed batches
//! - **client**: HTTP export client with retry logic
//! - **server**: HTTP ingress for fragments
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use magic_aggregator::aggregator::{Aggregator, AggregatorConfig};
//! use magic_aggregator::config::Config;
//! use magic_aggregator::consumer;
//! use magic_aggregator::server::{self, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let aggregator = Arc::new(Aggregator::new(AggregatorConfig::from(&config)));
//!     let consumer = consumer::from_config(&config).expect("Failed to build consumer");
//!     let state = Arc::new(AppState::new(aggregator, consumer));
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr).await.unwrap();
//!     server::serve(listener, state, async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await
//!     .unwrap();
//! }
//! ```

pub mod aggregator;
pub mod client;
pub mod config;
pub mod consumer;
pub mod metric;
pub mod server;

pub use aggregator::{AggregateError, Aggregator, AggregatorConfig, AggregatorStats, Submission};
pub use client::{ClientError, ExportClient, ExportResponse};
pub use config::{Config, ConfigError, ExportMode};
pub use consumer::{ConsumerError, HttpConsumer, LoggingConsumer, MetricsConsumer};
pub use metric::{IngestRequest, Metric, MetricBatch};
