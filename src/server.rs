//! HTTP ingress for metric fragments.
//!
//! # Endpoints
//!
//! - `POST /v1/metrics` (alias `POST /metrics`) - submit fragments
//! - `GET /v1/stats` - aggregator statistics
//! - `GET /health` - liveness

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::aggregator::{AggregateError, Aggregator, AggregatorStats, Submission};
use crate::consumer::MetricsConsumer;
use crate::metric::IngestRequest;

/// Shared application state
pub struct AppState {
    aggregator: Arc<Aggregator>,
    consumer: Arc<dyn MetricsConsumer>,
}

impl AppState {
    pub fn new(aggregator: Arc<Aggregator>, consumer: Arc<dyn MetricsConsumer>) -> Self {
        Self {
            aggregator,
            consumer,
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub code: StatusCode,
    pub status: &'static str,
    pub error: String,
}

impl ApiError {
    fn new(code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            code,
            status: "fail",
            error: error.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code, Json(self)).into_response()
    }
}

impl From<AggregateError> for ApiError {
    fn from(err: AggregateError) -> Self {
        let code = match err {
            AggregateError::Overflow { .. } => StatusCode::CONFLICT,
            AggregateError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(code, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

/// Successful ingest response
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub request_id: String,
    pub complete: bool,
    pub received: usize,
    pub expected: usize,
}

/// Build the ingress router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/metrics", post(ingest))
        .route("/metrics", post(ingest))
        .route("/v1/stats", get(stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router(state)` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Ingress server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// POST /v1/metrics
async fn ingest(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(request) = payload?;
    let request_id = request.request_id;

    let submission = state
        .aggregator
        .submit_all(&request_id, request.expected_count, request.metrics)?;

    match submission {
        Submission::Pending { received, expected } => Ok(Json(IngestResponse {
            status: "ok",
            request_id,
            complete: false,
            received,
            expected,
        })),
        Submission::Complete(batch) => {
            let size = batch.len();
            info!(
                request_id = %request_id,
                batch_size = size,
                consumer = state.consumer.name(),
                "Forwarding completed batch"
            );

            if let Err(e) = state.consumer.consume(batch).await {
                error!(request_id = %request_id, error = %e, "Failed to forward batch");
                return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
            }

            Ok(Json(IngestResponse {
                status: "ok",
                request_id,
                complete: true,
                received: size,
                expected: size,
            }))
        }
    }
}

/// GET /v1/stats
async fn stats(State(state): State<Arc<AppState>>) -> Json<AggregatorStats> {
    Json(state.aggregator.stats())
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::consumer::ConsumerError;
    use crate::metric::MetricBatch;
    use async_trait::async_trait;
    use axum::body::{self, Body};
    use axum::http::Request;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tower::ServiceExt; // for `oneshot`

    #[derive(Default)]
    struct RecordingConsumer {
        batches: Mutex<Vec<MetricBatch>>,
        fail: bool,
    }

    #[async_trait]
    impl MetricsConsumer for RecordingConsumer {
        fn name(&self) -> &str {
            "recording"
        }

        async fn consume(&self, batch: MetricBatch) -> Result<(), ConsumerError> {
            if self.fail {
                return Err(ConsumerError::Encode(
                    serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
                ));
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn setup(consumer: Arc<RecordingConsumer>) -> (Router, Arc<Aggregator>) {
        let aggregator = Arc::new(Aggregator::new(AggregatorConfig::new(
            Duration::from_secs(60),
            2,
        )));
        let state = Arc::new(AppState::new(aggregator.clone(), consumer));
        (router(state), aggregator)
    }

    async fn post_json(app: &Router, uri: &str, payload: String) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_pending_then_complete_forwards_once() {
        let consumer = Arc::new(RecordingConsumer::default());
        let (app, aggregator) = setup(consumer.clone());

        let first = serde_json::json!({
            "RequestId": "abc",
            "ExpectedCount": 3,
            "Metrics": [{"Name": "a", "Value": 1}, {"Name": "b", "Value": 2}]
        });
        let (status, body) = post_json(&app, "/v1/metrics", first.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["complete"], false);
        assert_eq!(body["received"], 2);
        assert!(aggregator.is_pending("abc"));
        assert!(consumer.batches.lock().is_empty());

        let second = serde_json::json!({
            "RequestId": "abc",
            "Metrics": [{"Name": "c", "Value": 3}]
        });
        let (status, body) = post_json(&app, "/metrics", second.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["complete"], true);

        let batches = consumer.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].request_id, "abc");
        assert_eq!(batches[0].len(), 3);
        assert!(!aggregator.is_pending("abc"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_client_error() {
        let (app, _) = setup(Arc::new(RecordingConsumer::default()));

        let (status, body) = post_json(&app, "/v1/metrics", "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "fail");
    }

    #[tokio::test]
    async fn test_missing_fields_is_client_error() {
        let (app, _) = setup(Arc::new(RecordingConsumer::default()));

        let (status, body) =
            post_json(&app, "/v1/metrics", r#"{"RequestId": "abc"}"#.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "fail");
    }

    #[tokio::test]
    async fn test_missing_expected_count_is_client_error() {
        let (app, _) = setup(Arc::new(RecordingConsumer::default()));
        let payload = serde_json::json!({"RequestId": "r", "Metrics": [{"Name": "a", "Value": 1}]});

        let (status, body) = post_json(&app, "/v1/metrics", payload.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no expected count"));
    }

    #[tokio::test]
    async fn test_overflow_is_conflict() {
        let (app, _) = setup(Arc::new(RecordingConsumer::default()));
        let payload = serde_json::json!({
            "RequestId": "r",
            "ExpectedCount": 1,
            "Metrics": [{"Name": "a", "Value": 1}, {"Name": "b", "Value": 2}]
        });

        let (status, body) = post_json(&app, "/v1/metrics", payload.to_string()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "fail");
    }

    #[tokio::test]
    async fn test_capacity_is_service_unavailable() {
        let (app, _) = setup(Arc::new(RecordingConsumer::default()));

        for id in ["a", "b", "c"] {
            let payload = serde_json::json!({
                "RequestId": id,
                "ExpectedCount": 2,
                "Metrics": [{"Name": "x", "Value": 1}]
            });
            let (status, _) = post_json(&app, "/v1/metrics", payload.to_string()).await;
            if id == "c" {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            } else {
                assert_eq!(status, StatusCode::OK);
            }
        }
    }

    #[tokio::test]
    async fn test_consumer_failure_is_server_error() {
        let consumer = Arc::new(RecordingConsumer {
            fail: true,
            ..RecordingConsumer::default()
        });
        let (app, aggregator) = setup(consumer);
        let payload = serde_json::json!({
            "RequestId": "r",
            "ExpectedCount": 1,
            "Metrics": [{"Name": "a", "Value": 1}]
        });

        let (status, body) = post_json(&app, "/v1/metrics", payload.to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "fail");
        // No dead-lettering: the batch is not kept.
        assert!(!aggregator.is_pending("r"));
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (app, _) = setup(Arc::new(RecordingConsumer::default()));
        let payload = serde_json::json!({
            "RequestId": "r",
            "ExpectedCount": 2,
            "Metrics": [{"Name": "a", "Value": 1}]
        });
        post_json(&app, "/v1/metrics", payload.to_string()).await;

        let (status, body) = get_json(&app, "/v1/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending_entries"], 1);
        assert_eq!(body["fragments_received"], 1);

        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_serve_shuts_down_gracefully() {
        let consumer = Arc::new(RecordingConsumer::default());
        let state = Arc::new(AppState::new(Arc::new(Aggregator::with_defaults()), consumer));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(serve(listener, state, async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
