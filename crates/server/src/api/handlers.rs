use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use runloom_core::{
    connector::ConnectorInfo,
    metrics::MetricsSnapshot,
    queue::{DeadLetter, QueueStats},
    workflow::{OrchestrateRequest, OrchestrateResponse},
    AgentRun, RunId, RunStep, StepId, ToolExecution, WorkflowDag, WorkflowVersion,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid run ID"))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishWorkflowRequest {
    pub workspace_slug: String,
    pub workflow_name: String,
    pub dag: WorkflowDag,
}

/// Publish a new version of a workflow
pub async fn publish_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowVersion>)> {
    let version = state
        .engine
        .publish_workflow(&req.workspace_slug, &req.workflow_name, req.dag)?;

    tracing::info!(
        "Published {}/{} version {}",
        req.workspace_slug,
        req.workflow_name,
        version.version
    );

    Ok((StatusCode::CREATED, Json(version)))
}

/// Start a run; an `Idempotency-Key` header takes precedence over the body field
pub async fn orchestrate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<OrchestrateRequest>,
) -> ApiResult<(StatusCode, Json<OrchestrateResponse>)> {
    if let Some(value) = headers.get(IDEMPOTENCY_HEADER) {
        let key = value
            .to_str()
            .map_err(|_| ApiError::bad_request("Idempotency-Key must be visible ASCII"))?;
        if !key.is_empty() {
            req.idempotency_key = Some(key.to_string());
        }
    }

    let response = state.engine.orchestrate(req).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize)]
pub struct RunDetailsResponse {
    pub run: AgentRun,
    pub steps: Vec<RunStep>,
}

/// Get a run with its steps
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunDetailsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let (run, steps) = state.engine.run_details(run_id)?;
    Ok(Json(RunDetailsResponse { run, steps }))
}

#[derive(Debug, Serialize)]
pub struct ToolExecutionsResponse {
    pub executions: Vec<ToolExecution>,
}

/// Connector calls recorded for one step of a run
pub async fn list_tool_executions(
    State(state): State<Arc<AppState>>,
    Path((run_id, step_id)): Path<(String, String)>,
) -> ApiResult<Json<ToolExecutionsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let step_id: StepId = step_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid step ID"))?;

    let executions = state.engine.tool_executions(run_id, step_id)?;
    Ok(Json(ToolExecutionsResponse { executions }))
}

#[derive(Debug, Serialize)]
pub struct ListConnectorsResponse {
    pub connectors: Vec<ConnectorInfo>,
}

pub async fn list_connectors(State(state): State<Arc<AppState>>) -> Json<ListConnectorsResponse> {
    Json(ListConnectorsResponse {
        connectors: state.engine.registry().list(),
    })
}

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics().snapshot())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetter>,
    pub stats: QueueStats,
}

/// Jobs parked on the dead-letter queue
pub async fn list_dead_letters(State(state): State<Arc<AppState>>) -> Json<DeadLettersResponse> {
    Json(DeadLettersResponse {
        dead_letters: state.queue.dead_letters(),
        stats: state.queue.stats(),
    })
}
