use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use runloom_core::EngineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the engine and the API server, stopping both on ctrl-c
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(&config)?);

    let cancel = CancellationToken::new();
    let engine_handles = state.engine.start(cancel.clone());

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down engine");
    cancel.cancel();
    engine_handles.join().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Create the API router
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/workflows", post(handlers::publish_workflow))
        .route("/api/runs", post(handlers::orchestrate))
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route(
            "/api/runs/{run_id}/steps/{step_id}/executions",
            get(handlers::list_tool_executions),
        )
        .route("/api/connectors", get(handlers::list_connectors))
        .route("/api/metrics", get(handlers::get_metrics))
        .route("/api/dead-letters", get(handlers::list_dead_letters))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "runloom",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

fn status_for(error: &anyhow::Error) -> StatusCode {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(EngineError::InvalidDag(_)) | Some(EngineError::Validation { .. }) => {
            StatusCode::BAD_REQUEST
        }
        Some(EngineError::DuplicateConnector(_)) => StatusCode::CONFLICT,
        Some(EngineError::EnqueueFailure { .. })
        | Some(EngineError::Queue(_))
        | Some(EngineError::TransactionTimeout { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "Request failed: {}", self.error);
        }

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let config = ServerConfig::load(&dir.path().join("runloom.toml"), dir.path().to_path_buf())
            .unwrap();
        Arc::new(AppState::new(&config).unwrap())
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn echo_dag() -> serde_json::Value {
        serde_json::json!({
            "nodes": [
                {"id": "a", "connector": "core", "action": "echo", "config": {"value": 1}},
                {"id": "b", "connector": "core", "action": "echo", "config": {"value": 2}}
            ],
            "edges": [{"from": "a", "to": "b"}]
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let (status, body) = send(create_router(test_state(&dir)), "GET", "/api/health", None, &[]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "runloom");
    }

    #[tokio::test]
    async fn test_orchestrate_unknown_workflow_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let (status, body) = send(
            create_router(test_state(&dir)),
            "POST",
            "/api/runs",
            Some(serde_json::json!({"workspaceSlug": "acme", "workflowName": "missing"})),
            &[],
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_publish_rejects_cyclic_dag() {
        let dir = tempfile::TempDir::new().unwrap();
        let (status, _) = send(
            create_router(test_state(&dir)),
            "POST",
            "/api/workflows",
            Some(serde_json::json!({
                "workspaceSlug": "acme",
                "workflowName": "loop",
                "dag": {
                    "nodes": [
                        {"id": "a", "connector": "core", "action": "echo"},
                        {"id": "b", "connector": "core", "action": "echo"}
                    ],
                    "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
                }
            })),
            &[],
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_and_orchestrate_with_idempotency_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, body) = send(
            create_router(state.clone()),
            "POST",
            "/api/workflows",
            Some(serde_json::json!({
                "workspaceSlug": "acme",
                "workflowName": "sync",
                "dag": echo_dag()
            })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], 1);

        let request = serde_json::json!({
            "workspaceSlug": "acme",
            "workflowName": "sync",
            "input": {"name": "ada"}
        });
        let (status, first) = send(
            create_router(state.clone()),
            "POST",
            "/api/runs",
            Some(request.clone()),
            &[("idempotency-key", "req-1")],
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["status"], "queued");
        assert_eq!(first["stepsEnqueued"], 1);

        let (status, second) = send(
            create_router(state.clone()),
            "POST",
            "/api/runs",
            Some(request),
            &[("idempotency-key", "req-1")],
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(second["runId"], first["runId"]);
        assert_eq!(second["stepsEnqueued"], 0);

        let run_id = first["runId"].as_str().unwrap().to_string();
        let (status, details) = send(
            create_router(state),
            "GET",
            &format!("/api/runs/{}", run_id),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["run"]["status"], "running");
        assert_eq!(details["run"]["idempotencyKey"], "req-1");
        assert_eq!(details["steps"].as_array().unwrap().len(), 1);
        assert_eq!(details["steps"][0]["nodeId"], "a");
        assert_eq!(details["steps"][0]["maxAttempts"], 3);
        assert!(details["steps"][0].get("max_attempts").is_none());
    }

    #[tokio::test]
    async fn test_get_run_rejects_malformed_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let (status, body) = send(
            create_router(test_state(&dir)),
            "GET",
            "/api/runs/not-a-uuid",
            None,
            &[],
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid run ID");
    }

    #[tokio::test]
    async fn test_list_connectors_and_metrics() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, body) = send(create_router(state.clone()), "GET", "/api/connectors", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        let keys: Vec<_> = body["connectors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["key"].as_str().unwrap().to_string())
            .collect();
        assert!(keys.contains(&"core".to_string()));

        let (status, body) = send(create_router(state.clone()), "GET", "/api/metrics", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["counters"].as_array().unwrap().is_empty());
        assert!(body["summaries"].as_array().unwrap().is_empty());

        let (status, body) = send(create_router(state), "GET", "/api/dead-letters", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["deadLetters"].as_array().unwrap().is_empty());
    }
}
