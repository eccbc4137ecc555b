pub mod redb_store;

pub use redb_store::RedbRunStore;

use crate::error::StoreResult;
use crate::types::{
    AgentRun, IdempotencyRecord, OutboxEntry, RunId, RunStatus, RunStep, StepId, ToolExecution,
    VersionId, Workflow, WorkflowDag, WorkflowId, WorkflowVersion, Workspace, WorkspaceId,
};
use std::time::Duration;

/// Everything written atomically when a run is created
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run: AgentRun,
    pub steps: Vec<RunStep>,
    pub outbox: Vec<OutboxEntry>,
    pub idempotency: Option<IdempotencyRecord>,
}

/// Outcome of `RunStore::create_run`
#[derive(Debug, Clone)]
pub enum RunCreation {
    Created { run: AgentRun, steps: Vec<RunStep> },
    /// The idempotency key already pointed at this run
    Existing { run: AgentRun, steps: Vec<RunStep> },
}

/// Transactional persistence for the catalog, runs, steps and the outbox
pub trait RunStore: Send + Sync {
    /// Append `dag` as the next version of `workflow_name`, creating the
    /// workspace and workflow on first use. The lookups, the version
    /// numbering and the writes share one transaction.
    fn publish_version(
        &self,
        workspace_slug: &str,
        workflow_name: &str,
        dag: WorkflowDag,
    ) -> StoreResult<WorkflowVersion>;

    fn workspace_by_slug(&self, slug: &str) -> StoreResult<Option<Workspace>>;

    fn workflow_by_name(&self, workspace_id: WorkspaceId, name: &str) -> StoreResult<Option<Workflow>>;

    fn get_version(&self, version_id: VersionId) -> StoreResult<Option<WorkflowVersion>>;

    /// All versions of a workflow, oldest first
    fn list_versions(&self, workflow_id: WorkflowId) -> StoreResult<Vec<WorkflowVersion>>;

    fn find_idempotency(&self, workspace_id: WorkspaceId, key: &str) -> StoreResult<Option<IdempotencyRecord>>;

    /// Write run, idempotency record, steps and outbox rows in one
    /// transaction, rolled back if it takes longer than `timeout`.
    fn create_run(&self, new_run: NewRun, timeout: Duration) -> StoreResult<RunCreation>;

    fn get_run(&self, run_id: RunId) -> StoreResult<Option<AgentRun>>;

    fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<AgentRun>>;

    /// Move a `running` run to `status`. Returns false if it already left `running`.
    fn transition_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> StoreResult<bool>;

    fn get_step(&self, run_id: RunId, step_id: StepId) -> StoreResult<Option<RunStep>>;

    fn list_steps(&self, run_id: RunId) -> StoreResult<Vec<RunStep>>;

    fn update_step(&self, step: &RunStep) -> StoreResult<()>;

    /// Insert a new step and its outbox row; `DuplicateNode` if the node
    /// already has a step in the run.
    fn insert_step(&self, step: &RunStep, outbox: &OutboxEntry) -> StoreResult<()>;

    /// Update an existing step and queue its next attempt atomically
    fn schedule_retry(&self, step: &RunStep, outbox: &OutboxEntry) -> StoreResult<()>;

    fn record_tool_execution(&self, execution: &ToolExecution) -> StoreResult<()>;

    fn list_tool_executions(&self, step_id: StepId) -> StoreResult<Vec<ToolExecution>>;

    /// Oldest outbox rows first
    fn pending_outbox(&self, limit: usize) -> StoreResult<Vec<OutboxEntry>>;

    fn remove_outbox(&self, job_id: &str) -> StoreResult<()>;
}
