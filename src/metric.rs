//! Wire types for metric fragments and completed batches.
//!
//! Field names follow the JSON shape used by the magic receiver/exporter pair:
//! `RequestId`, `ExpectedCount`, `Metrics`, `Name`, `Value`.

use serde::{Deserialize, Serialize};

/// A single named metric value. One metric is one fragment of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name
    #[serde(rename = "Name")]
    pub name: String,

    /// Integer value of the metric
    #[serde(rename = "Value")]
    pub value: i64,
}

impl Metric {
    /// Create a new metric fragment.
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Inbound message carrying one or more fragments for a request.
///
/// `ExpectedCount` is only required on the message that opens a request;
/// later messages may omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Correlation key grouping fragments into one logical batch
    #[serde(rename = "RequestId")]
    pub request_id: String,

    /// Total number of fragments the request will deliver
    #[serde(
        rename = "ExpectedCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_count: Option<usize>,

    /// Fragments carried by this message
    #[serde(rename = "Metrics")]
    pub metrics: Vec<Metric>,
}

/// A completed batch, forwarded downstream once every fragment has arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricBatch {
    /// Request identifier the batch was accumulated under
    #[serde(rename = "RequestId")]
    pub request_id: String,

    /// All fragments, in arrival order
    #[serde(rename = "Metrics")]
    pub metrics: Vec<Metric>,
}

impl MetricBatch {
    /// Create a new batch for the given request.
    pub fn new(request_id: impl Into<String>, metrics: Vec<Metric>) -> Self {
        Self {
            request_id: request_id.into(),
            metrics,
        }
    }

    /// Get the number of metrics in the batch.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
