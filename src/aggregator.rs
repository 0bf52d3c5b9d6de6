//! Request-scoped aggregation of metric fragments.
//!
//! Fragments arrive tagged with a request identifier. The [`Aggregator`]
//! accumulates them per identifier and releases the full batch exactly once,
//! when the accumulated count reaches the expected count declared by the
//! message that opened the request.
//!
//! Policies:
//! - the first declared expected count wins; later disagreeing counts are
//!   logged and ignored
//! - a submission that would exceed the expected count is rejected whole
//! - pending entries older than the TTL are evicted, lazily on submit and by
//!   [`sweep_task`]
//! - no new entry is opened while `max_pending` entries are outstanding

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metric::{Metric, MetricBatch};

/// Default lifetime of a pending entry.
const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(300);

/// Default cap on simultaneously pending entries.
const DEFAULT_MAX_PENDING: usize = 10_000;

/// Configuration for the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How long an entry may wait for its remaining fragments
    pub pending_ttl: Duration,

    /// Maximum number of entries pending at once
    pub max_pending: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            pending_ttl: DEFAULT_PENDING_TTL,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl AggregatorConfig {
    /// Create a new aggregator config.
    pub fn new(pending_ttl: Duration, max_pending: usize) -> Self {
        Self {
            pending_ttl,
            max_pending,
        }
    }
}

impl From<&Config> for AggregatorConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.pending_ttl, config.max_pending)
    }
}

/// Statistics about aggregator operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    /// Fragments accepted into a pending entry or a completed batch
    pub fragments_received: u64,

    /// Batches released on reaching their expected count
    pub batches_completed: u64,

    /// Pending entries evicted by TTL
    pub entries_expired: u64,

    /// Submissions refused by policy
    pub submissions_rejected: u64,

    /// Entries currently waiting for fragments
    pub pending_entries: usize,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The request still waits for more fragments
    Pending { received: usize, expected: usize },

    /// The request reached its expected count; the entry has been evicted
    Complete(MetricBatch),
}

impl Submission {
    /// Whether this submission completed its request.
    pub fn is_complete(&self) -> bool {
        matches!(self, Submission::Complete(_))
    }
}

/// Errors that can occur when submitting fragments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("request id must not be empty")]
    EmptyRequestId,

    #[error("submission for request '{request_id}' carries no metrics")]
    EmptyBatch { request_id: String },

    #[error("request '{request_id}' is not pending and no expected count was given")]
    MissingExpectedCount { request_id: String },

    #[error("expected count for request '{request_id}' must be greater than 0")]
    InvalidExpectedCount { request_id: String },

    #[error(
        "request '{request_id}' expects {expected} fragments, has {received}, \
         cannot accept {incoming} more"
    )]
    Overflow {
        request_id: String,
        expected: usize,
        received: usize,
        incoming: usize,
    },

    #[error("too many pending requests (max {max_pending})")]
    CapacityExceeded { max_pending: usize },
}

/// Partial accumulation state for one request identifier.
#[derive(Debug)]
struct PendingEntry {
    metrics: Vec<Metric>,
    expected: usize,
    created_at: Instant,
}

impl PendingEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, PendingEntry>,
    stats: AggregatorStats,
}

impl Inner {
    fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|request_id, entry| {
            let expired = entry.is_expired(now, ttl);
            if expired {
                warn!(
                    request_id = %request_id,
                    received = entry.metrics.len(),
                    expected = entry.expected,
                    "Pending request expired before completion"
                );
            }
            !expired
        });
        let evicted = before - self.entries.len();
        self.stats.entries_expired += evicted as u64;
        evicted
    }
}

/// Thread-safe store of pending requests.
///
/// Share it behind an `Arc`; every operation takes the internal lock for the
/// duration of one map update only.
///
/// # Example
///
/// ```
/// use magic_aggregator::aggregator::{Aggregator, Submission};
/// use magic_aggregator::metric::Metric;
///
/// let aggregator = Aggregator::with_defaults();
///
/// let first = aggregator.submit("abc", Some(2), Metric::new("a", 1)).unwrap();
/// assert!(!first.is_complete());
///
/// match aggregator.submit("abc", None, Metric::new("b", 2)).unwrap() {
///     Submission::Complete(batch) => assert_eq!(batch.len(), 2),
///     Submission::Pending { .. } => unreachable!(),
/// }
/// ```
#[derive(Debug)]
pub struct Aggregator {
    inner: Mutex<Inner>,
    config: AggregatorConfig,
}

impl Aggregator {
    /// Create a new aggregator with the given configuration.
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    /// Create a new aggregator with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(AggregatorConfig::default())
    }

    /// Submit a single fragment for `request_id`.
    ///
    /// `expected_count` is required when this fragment opens the request and
    /// optional afterwards.
    pub fn submit(
        &self,
        request_id: &str,
        expected_count: Option<usize>,
        fragment: Metric,
    ) -> Result<Submission, AggregateError> {
        self.submit_all(request_id, expected_count, vec![fragment])
    }

    /// Submit every fragment of one ingress message atomically.
    ///
    /// Either all fragments are appended or none are.
    pub fn submit_all(
        &self,
        request_id: &str,
        expected_count: Option<usize>,
        fragments: Vec<Metric>,
    ) -> Result<Submission, AggregateError> {
        self.submit_at(Instant::now(), request_id, expected_count, fragments)
    }

    fn submit_at(
        &self,
        now: Instant,
        request_id: &str,
        expected_count: Option<usize>,
        fragments: Vec<Metric>,
    ) -> Result<Submission, AggregateError> {
        let mut inner = self.inner.lock();
        let result = self.apply(&mut inner, now, request_id, expected_count, fragments);

        match &result {
            Ok(Submission::Complete(batch)) => {
                inner.stats.batches_completed += 1;
                debug!(
                    request_id = %request_id,
                    batch_size = batch.len(),
                    "Request complete"
                );
            }
            Ok(Submission::Pending { received, expected }) => {
                debug!(
                    request_id = %request_id,
                    received = *received,
                    expected = *expected,
                    "Request pending"
                );
            }
            Err(e) => {
                inner.stats.submissions_rejected += 1;
                warn!(request_id = %request_id, error = %e, "Submission rejected");
            }
        }

        result
    }

    fn apply(
        &self,
        inner: &mut Inner,
        now: Instant,
        request_id: &str,
        expected_count: Option<usize>,
        fragments: Vec<Metric>,
    ) -> Result<Submission, AggregateError> {
        if request_id.is_empty() {
            return Err(AggregateError::EmptyRequestId);
        }
        if fragments.is_empty() {
            return Err(AggregateError::EmptyBatch {
                request_id: request_id.to_string(),
            });
        }
        if expected_count == Some(0) {
            return Err(AggregateError::InvalidExpectedCount {
                request_id: request_id.to_string(),
            });
        }

        let ttl = self.config.pending_ttl;
        let incoming = fragments.len();

        // An expired entry for this id is dropped so the submission starts fresh.
        if inner
            .entries
            .get(request_id)
            .is_some_and(|entry| entry.is_expired(now, ttl))
        {
            inner.entries.remove(request_id);
            inner.stats.entries_expired += 1;
            warn!(request_id = %request_id, "Pending request expired, starting a new one");
        }

        if let Some(entry) = inner.entries.get_mut(request_id) {
            if let Some(declared) = expected_count {
                if declared != entry.expected {
                    warn!(
                        request_id = %request_id,
                        declared = declared,
                        expected = entry.expected,
                        "Ignoring expected count that disagrees with the first one seen"
                    );
                }
            }

            let received = entry.metrics.len();
            if received + incoming > entry.expected {
                return Err(AggregateError::Overflow {
                    request_id: request_id.to_string(),
                    expected: entry.expected,
                    received,
                    incoming,
                });
            }

            entry.metrics.extend(fragments);
            inner.stats.fragments_received += incoming as u64;

            let received = entry.metrics.len();
            let expected = entry.expected;
            if received < expected {
                return Ok(Submission::Pending { received, expected });
            }

            let metrics = inner
                .entries
                .remove(request_id)
                .map(|entry| entry.metrics)
                .unwrap_or_default();
            return Ok(Submission::Complete(MetricBatch::new(request_id, metrics)));
        }

        let expected = expected_count.ok_or_else(|| AggregateError::MissingExpectedCount {
            request_id: request_id.to_string(),
        })?;

        if incoming > expected {
            return Err(AggregateError::Overflow {
                request_id: request_id.to_string(),
                expected,
                received: 0,
                incoming,
            });
        }

        if incoming == expected {
            inner.stats.fragments_received += incoming as u64;
            return Ok(Submission::Complete(MetricBatch::new(request_id, fragments)));
        }

        if inner.entries.len() >= self.config.max_pending {
            inner.expire(now, ttl);
            if inner.entries.len() >= self.config.max_pending {
                return Err(AggregateError::CapacityExceeded {
                    max_pending: self.config.max_pending,
                });
            }
        }

        inner.entries.insert(
            request_id.to_string(),
            PendingEntry {
                metrics: fragments,
                expected,
                created_at: now,
            },
        );
        inner.stats.fragments_received += incoming as u64;

        Ok(Submission::Pending {
            received: incoming,
            expected,
        })
    }

    /// Evict every pending entry older than the TTL.
    ///
    /// Returns the number of entries evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        self.inner.lock().expire(now, self.config.pending_ttl)
    }

    /// Get the number of requests currently pending.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check whether `request_id` has a pending entry.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.inner.lock().entries.contains_key(request_id)
    }

    /// Get a snapshot of aggregator statistics.
    pub fn stats(&self) -> AggregatorStats {
        let inner = self.inner.lock();
        AggregatorStats {
            pending_entries: inner.entries.len(),
            ..inner.stats.clone()
        }
    }

    /// Get the aggregator configuration.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }
}

/// Background task evicting expired entries every `sweep_interval`.
///
/// Runs until aborted.
pub async fn sweep_task(aggregator: Arc<Aggregator>, sweep_interval: Duration) {
    let mut ticker = interval(sweep_interval);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let evicted = aggregator.sweep();
        if evicted > 0 {
            info!(
                evicted = evicted,
                pending = aggregator.pending_count(),
                "Expired pending requests swept"
            );
        }
    }
}
