use super::catalog::resolve_workflow;
use super::dag::{initial_node_ids, validate_dag};
use super::dispatcher::OutboxDispatcher;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricsCollector, RUNS_STARTED};
use crate::storage::{NewRun, RunCreation, RunStore};
use crate::types::{
    AgentRun, ClientRunStatus, IdempotencyRecord, OutboxEntry, RunId, RunStatus, RunStep, StepJob,
    Trigger, WorkflowId, WorkspaceId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Request to start a run of the latest published version of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub workspace_slug: String,
    pub workflow_name: String,
    #[serde(default = "default_trigger")]
    pub trigger: Trigger,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_trigger() -> Trigger {
    Trigger::Manual
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateResponse {
    pub run_id: RunId,
    pub status: ClientRunStatus,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub steps_enqueued: usize,
}

/// SHA-256 over the parts of a request that define the run
pub fn request_fingerprint(request: &OrchestrateRequest) -> String {
    let canonical = serde_json::json!({
        "workflowName": request.workflow_name,
        "trigger": request.trigger,
        "input": request.input,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

/// Turns run requests into persisted runs with their initial steps
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    dispatcher: OutboxDispatcher,
    metrics: MetricsCollector,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        dispatcher: OutboxDispatcher,
        metrics: MetricsCollector,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            config,
        }
    }

    pub async fn orchestrate(&self, request: OrchestrateRequest) -> EngineResult<OrchestrateResponse> {
        let resolved = resolve_workflow(
            self.store.as_ref(),
            &request.workspace_slug,
            &request.workflow_name,
        )?;
        let dag = &resolved.version.dag;
        validate_dag(dag)?;
        let initial = initial_node_ids(dag);

        let fingerprint = request_fingerprint(&request);
        if let Some(key) = &request.idempotency_key {
            if let Some(record) = self.store.find_idempotency(resolved.workspace.id, key)? {
                return self.replay(&record, &fingerprint);
            }
        }

        let now = Utc::now();
        let run = AgentRun {
            id: RunId::new(),
            workflow_id: resolved.workflow.id,
            version_id: resolved.version.id,
            workspace_id: resolved.workspace.id,
            status: if initial.is_empty() {
                RunStatus::Completed
            } else {
                RunStatus::Running
            },
            trigger: request.trigger,
            input: request.input.clone(),
            output: None,
            error: None,
            started_at: now,
            ended_at: initial.is_empty().then_some(now),
            idempotency_key: request.idempotency_key.clone(),
        };

        let max_attempts = self.config.effective_max_attempts();
        let mut steps = Vec::with_capacity(initial.len());
        let mut outbox = Vec::with_capacity(initial.len());
        for node_id in &initial {
            let node = dag
                .node(node_id)
                .ok_or_else(|| EngineError::not_found(format!("node {}", node_id)))?;
            let step = RunStep::ready(run.id, node, &run.input, max_attempts);
            outbox.push(OutboxEntry::new(StepJob::for_step(&run, node, &step), step.attempt));
            steps.push(step);
        }

        let idempotency = request.idempotency_key.as_ref().map(|key| IdempotencyRecord {
            key: key.clone(),
            workspace_id: run.workspace_id,
            run_id: run.id,
            fingerprint: fingerprint.clone(),
            created_at: now,
        });

        let new_run = NewRun {
            run,
            steps,
            outbox: outbox.clone(),
            idempotency,
        };

        let (run, steps) = match self
            .store
            .create_run(new_run, self.config.transaction_timeout())?
        {
            RunCreation::Created { run, steps } => (run, steps),
            RunCreation::Existing { run, steps } => {
                tracing::info!(run_id = %run.id, "Concurrent request with the same idempotency key won");
                return Ok(Self::response(&run, &steps, 0));
            }
        };

        self.metrics.increment_counter(RUNS_STARTED, &[]);
        tracing::info!(
            run_id = %run.id,
            workspace = %request.workspace_slug,
            workflow = %request.workflow_name,
            steps = steps.len(),
            "Run created"
        );

        // Rows stay in the outbox if the queue is unreachable; the periodic
        // drain delivers them later.
        self.dispatcher.dispatch_or_defer(&outbox).await;

        Ok(Self::response(&run, &steps, outbox.len()))
    }

    fn replay(&self, record: &IdempotencyRecord, fingerprint: &str) -> EngineResult<OrchestrateResponse> {
        if record.fingerprint != fingerprint {
            tracing::warn!(
                key = %record.key,
                run_id = %record.run_id,
                "Idempotency key reused with a different request, returning original run"
            );
        }

        let run = self
            .store
            .get_run(record.run_id)?
            .ok_or_else(|| EngineError::not_found(format!("run {}", record.run_id)))?;
        let steps = self.store.list_steps(run.id)?;
        tracing::debug!(run_id = %run.id, "Returning existing run for idempotency key");
        Ok(Self::response(&run, &steps, 0))
    }

    fn response(run: &AgentRun, steps: &[RunStep], steps_enqueued: usize) -> OrchestrateResponse {
        OrchestrateResponse {
            run_id: run.id,
            status: ClientRunStatus::project(run.status, steps),
            workflow_id: run.workflow_id,
            workspace_id: run.workspace_id,
            steps_enqueued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: serde_json::Value) -> OrchestrateRequest {
        OrchestrateRequest {
            workspace_slug: "acme".to_string(),
            workflow_name: "sync".to_string(),
            trigger: Trigger::Manual,
            input,
            idempotency_key: Some("k".to_string()),
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order_and_idempotency_key() {
        let a = request(serde_json::json!({"x": 1, "y": 2}));
        let mut b = request(serde_json::json!({"y": 2, "x": 1}));
        b.idempotency_key = Some("other".to_string());

        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
        assert_eq!(request_fingerprint(&a).len(), 64);
        assert_ne!(
            request_fingerprint(&a),
            request_fingerprint(&request(serde_json::json!({"x": 2})))
        );
    }

    #[test]
    fn test_request_defaults() {
        let request: OrchestrateRequest = serde_json::from_value(serde_json::json!({
            "workspaceSlug": "acme",
            "workflowName": "sync"
        }))
        .unwrap();

        assert_eq!(request.trigger, Trigger::Manual);
        assert!(request.input.is_null());
        assert!(request.idempotency_key.is_none());
    }
}
