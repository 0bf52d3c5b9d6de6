//! HTTP client for forwarding completed metric batches downstream.
//!
//! Connection pooling comes from reqwest; failed posts are retried with
//! exponential backoff and jitter when the failure looks transient.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metric::MetricBatch;

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Response from the downstream metrics endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportResponse {
    /// Status reported by the endpoint, `"ok"` when the body was empty
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "ok".to_string()
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("All {attempts} retry attempts exhausted. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// HTTP client posting completed batches as JSON to the export URL.
///
/// # Example
///
/// ```no_run
/// use magic_aggregator::client::ExportClient;
/// use magic_aggregator::config::Config;
/// use magic_aggregator::metric::{Metric, MetricBatch};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = ExportClient::new(&config).expect("Failed to create client");
///
///     let batch = MetricBatch::new("req-1", vec![Metric::new("cpu", 42)]);
///     match client.send_batch(&batch).await {
///         Ok(response) => println!("Exported: {}", response.status),
///         Err(e) => eprintln!("Failed to export: {}", e),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ExportClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL completed batches are posted to
    export_url: String,

    /// Maximum number of retry attempts
    max_retries: u32,

    /// Request timeout duration
    timeout: Duration,
}

impl ExportClient {
    /// Create a new export client from service configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.export_url.clone(),
            config.request_timeout,
            config.max_retries,
        )
    }

    /// Create a new export client with custom settings.
    pub fn with_settings(
        export_url: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            export_url: export_url.into(),
            max_retries,
            timeout,
        })
    }

    /// Post a completed batch downstream, retrying transient failures.
    ///
    /// Retried: connection errors, timeouts, 5xx and 429 responses.
    /// Not retried: other 4xx responses and unparseable bodies.
    pub async fn send_batch(&self, batch: &MetricBatch) -> Result<ExportResponse, ClientError> {
        debug!(
            request_id = %batch.request_id,
            batch_size = batch.len(),
            url = %self.export_url,
            "Exporting metric batch"
        );

        let mut last_error: Option<ClientError> = None;
        let mut attempt = 0;

        while attempt <= self.max_retries {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_request(batch).await {
                Ok(response) => {
                    info!(
                        request_id = %batch.request_id,
                        batch_size = batch.len(),
                        status = %response.status,
                        "Exported metric batch"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    let is_retryable = self.is_retryable_error(&e);

                    if is_retryable && attempt < self.max_retries {
                        warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            "Export failed, will retry"
                        );
                        last_error = Some(e);
                        attempt += 1;
                    } else if is_retryable && attempt > 0 {
                        error!(error = %e, attempts = attempt + 1, "Export retries exhausted");
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt + 1,
                            last_error: e.to_string(),
                        });
                    } else {
                        error!(
                            error = %e,
                            attempts = attempt + 1,
                            retryable = is_retryable,
                            "Export failed permanently"
                        );
                        return Err(e);
                    }
                }
            }
        }

        let last_error_msg = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());

        Err(ClientError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error: last_error_msg,
        })
    }

    /// Send a single HTTP request without retry logic.
    async fn send_request(&self, batch: &MetricBatch) -> Result<ExportResponse, ClientError> {
        let response = self
            .client
            .post(&self.export_url)
            .timeout(self.timeout)
            .json(batch)
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(ExportResponse {
                    status: default_status(),
                });
            }
            serde_json::from_str(&body).map_err(|e| ClientError::Parse(e.to_string()))
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }

    /// Backoff for a retry attempt: `min(base * 2^attempt + jitter, max)`,
    /// with jitter up to 25% of the exponential delay.
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = DEFAULT_BASE_DELAY_MS.saturating_mul(1 << attempt.min(10));
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);
        let total_delay = exponential_delay
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    fn is_retryable_error(&self, error: &ClientError) -> bool {
        match error {
            ClientError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ClientError::Timeout => true,
            ClientError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            ClientError::Parse(_) => false,
            ClientError::RetriesExhausted { .. } => false,
            ClientError::Config(_) => false,
        }
    }

    /// Get the configured export URL.
    pub fn export_url(&self) -> &str {
        &self.export_url
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
