//! Downstream consumers for completed metric batches.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::client::{ClientError, ExportClient};
use crate::config::{Config, ExportMode};
use crate::metric::MetricBatch;

/// Errors returned by a consumer that could not accept a batch.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("export failed: {0}")]
    Export(#[from] ClientError),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Receives every batch the aggregator completes.
#[async_trait]
pub trait MetricsConsumer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Take ownership of a completed batch.
    async fn consume(&self, batch: MetricBatch) -> Result<(), ConsumerError>;
}

/// Posts each batch to the configured HTTP endpoint.
pub struct HttpConsumer {
    client: ExportClient,
}

impl HttpConsumer {
    pub fn new(client: ExportClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsConsumer for HttpConsumer {
    fn name(&self) -> &str {
        "http"
    }

    async fn consume(&self, batch: MetricBatch) -> Result<(), ConsumerError> {
        self.client.send_batch(&batch).await?;
        Ok(())
    }
}

/// Logs each batch as pretty-printed JSON.
pub struct LoggingConsumer {
    component_name: String,
}

impl LoggingConsumer {
    pub fn new(component_name: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
        }
    }
}

#[async_trait]
impl MetricsConsumer for LoggingConsumer {
    fn name(&self) -> &str {
        "log"
    }

    async fn consume(&self, batch: MetricBatch) -> Result<(), ConsumerError> {
        let body = serde_json::to_string_pretty(&batch)?;
        info!(
            component = %self.component_name,
            request_id = %batch.request_id,
            batch_size = batch.len(),
            "Batch arrived:\n{}",
            body
        );
        Ok(())
    }
}

/// Build the consumer selected by `config.export_mode`.
pub fn from_config(config: &Config) -> Result<Arc<dyn MetricsConsumer>, ClientError> {
    let consumer: Arc<dyn MetricsConsumer> = match config.export_mode {
        ExportMode::Log => Arc::new(LoggingConsumer::new(config.component_name.clone())),
        ExportMode::Http => Arc::new(HttpConsumer::new(ExportClient::new(config)?)),
    };
    Ok(consumer)
}
