use super::{NewRun, RunCreation, RunStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    AgentRun, IdempotencyRecord, NodeId, OutboxEntry, RunId, RunStatus, RunStep, StepId,
    ToolExecution, VersionId, Workflow, WorkflowDag, WorkflowId, WorkflowVersion, Workspace,
    WorkspaceId,
};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const WORKSPACES_TABLE: JsonTable = TableDefinition::new("workspaces");
const WORKSPACE_SLUGS_TABLE: JsonTable = TableDefinition::new("workspace_slugs");
const WORKFLOWS_TABLE: JsonTable = TableDefinition::new("workflows");
const WORKFLOW_NAMES_TABLE: JsonTable = TableDefinition::new("workflow_names");
const VERSIONS_TABLE: JsonTable = TableDefinition::new("workflow_versions");
const WORKFLOW_VERSIONS_TABLE: JsonTable = TableDefinition::new("workflow_version_index");
const RUNS_TABLE: JsonTable = TableDefinition::new("runs");
const STEPS_TABLE: JsonTable = TableDefinition::new("steps");
const RUN_NODES_TABLE: JsonTable = TableDefinition::new("run_nodes");
const IDEMPOTENCY_TABLE: JsonTable = TableDefinition::new("idempotency_keys");
const TOOL_EXECUTIONS_TABLE: JsonTable = TableDefinition::new("tool_executions");
const OUTBOX_TABLE: JsonTable = TableDefinition::new("outbox");

const ALL_TABLES: [JsonTable; 12] = [
    WORKSPACES_TABLE,
    WORKSPACE_SLUGS_TABLE,
    WORKFLOWS_TABLE,
    WORKFLOW_NAMES_TABLE,
    VERSIONS_TABLE,
    WORKFLOW_VERSIONS_TABLE,
    RUNS_TABLE,
    STEPS_TABLE,
    RUN_NODES_TABLE,
    IDEMPOTENCY_TABLE,
    TOOL_EXECUTIONS_TABLE,
    OUTBOX_TABLE,
];

/// Run store backed by a single redb file
#[derive(Clone)]
pub struct RedbRunStore {
    db: Arc<Database>,
}

impl RedbRunStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        for table in ALL_TABLES {
            write_txn.open_table(table).context("Failed to open table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StoreResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            write_json(&mut table, key, value)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StoreResult<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;
        Ok(read_json(&table, key)?)
    }

    fn scan<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StoreResult<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;
        Ok(scan_json(&table, prefix)?)
    }

    /// Resolve an index entry (`key -> id`) and load the record it points at
    fn get_indexed<T: DeserializeOwned>(
        &self,
        index: JsonTable,
        table: JsonTable,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let index = read_txn.open_table(index).context("Failed to open index")?;
        let id: Option<String> = read_json(&index, key)?;

        match id {
            Some(id) => {
                let table = read_txn.open_table(table).context("Failed to open table")?;
                Ok(read_json(&table, &id)?)
            }
            None => Ok(None),
        }
    }
}

fn step_key(run_id: RunId, step_id: StepId) -> String {
    format!("{}/{}", run_id, step_id)
}

fn node_key(run_id: RunId, node_id: &NodeId) -> String {
    format!("{}/{}", run_id, node_id)
}

fn idempotency_key(workspace_id: WorkspaceId, key: &str) -> String {
    format!("{}/{}", workspace_id, key)
}

fn write_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("Failed to serialize record")?;
    table
        .insert(key, bytes.as_slice())
        .context("Failed to insert record")?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>> {
    match table.get(key).context("Failed to get record")? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).context("Failed to deserialize record")?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for item in table.range(prefix..).context("Failed to scan table")? {
        let (key, value) = item.context("Failed to read item")?;
        if !key.value().starts_with(prefix) {
            break;
        }
        records.push(serde_json::from_slice(value.value()).context("Failed to deserialize record")?);
    }
    Ok(records)
}

/// Step row, unique `(run, node)` row and outbox row
fn insert_step_rows(
    steps: &mut Table<'_, &'static str, &'static [u8]>,
    nodes: &mut Table<'_, &'static str, &'static [u8]>,
    step: &RunStep,
) -> StoreResult<()> {
    let node = node_key(step.run_id, &step.node_id);
    if nodes.get(node.as_str()).context("Failed to read run node")?.is_some() {
        return Err(StoreError::DuplicateNode {
            run_id: step.run_id,
            node_id: step.node_id.clone(),
        });
    }
    write_json(nodes, &node, &step.id.to_string())?;
    write_json(steps, &step_key(step.run_id, step.id), step)?;
    Ok(())
}

impl RunStore for RedbRunStore {
    fn publish_version(
        &self,
        workspace_slug: &str,
        workflow_name: &str,
        dag: WorkflowDag,
    ) -> StoreResult<WorkflowVersion> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let version = {
            let mut workspaces = write_txn.open_table(WORKSPACES_TABLE).context("Failed to open table")?;
            let mut slugs = write_txn.open_table(WORKSPACE_SLUGS_TABLE).context("Failed to open table")?;
            let mut workflows = write_txn.open_table(WORKFLOWS_TABLE).context("Failed to open table")?;
            let mut names = write_txn.open_table(WORKFLOW_NAMES_TABLE).context("Failed to open table")?;
            let mut versions = write_txn.open_table(VERSIONS_TABLE).context("Failed to open table")?;
            let mut index = write_txn.open_table(WORKFLOW_VERSIONS_TABLE).context("Failed to open table")?;

            let workspace: Workspace = match read_json::<String>(&slugs, workspace_slug)? {
                Some(id) => read_json(&workspaces, &id)?
                    .ok_or_else(|| StoreError::Missing(format!("workspace {}", id)))?,
                None => {
                    let workspace = Workspace {
                        id: WorkspaceId::new(),
                        slug: workspace_slug.to_string(),
                        created_at: chrono::Utc::now(),
                    };
                    write_json(&mut workspaces, &workspace.id.to_string(), &workspace)?;
                    write_json(&mut slugs, &workspace.slug, &workspace.id.to_string())?;
                    workspace
                }
            };

            let name_key = format!("{}/{}", workspace.id, workflow_name);
            let workflow: Workflow = match read_json::<String>(&names, &name_key)? {
                Some(id) => read_json(&workflows, &id)?
                    .ok_or_else(|| StoreError::Missing(format!("workflow {}", id)))?,
                None => {
                    let workflow = Workflow {
                        id: WorkflowId::new(),
                        workspace_id: workspace.id,
                        name: workflow_name.to_string(),
                        created_at: chrono::Utc::now(),
                    };
                    write_json(&mut workflows, &workflow.id.to_string(), &workflow)?;
                    write_json(&mut names, &name_key, &workflow.id.to_string())?;
                    workflow
                }
            };

            // Index keys are zero-padded, so the last one is the latest version
            let latest: Option<String> = scan_json::<String>(&index, &format!("{}/", workflow.id))?.pop();
            let next = match latest {
                Some(id) => {
                    let latest: WorkflowVersion = read_json(&versions, &id)?
                        .ok_or_else(|| StoreError::Missing(format!("workflow version {}", id)))?;
                    latest.version + 1
                }
                None => 1,
            };

            let version = WorkflowVersion {
                id: VersionId::new(),
                workflow_id: workflow.id,
                version: next,
                dag,
                published: true,
                created_at: chrono::Utc::now(),
            };
            write_json(&mut versions, &version.id.to_string(), &version)?;
            write_json(
                &mut index,
                &format!("{}/{:010}", version.workflow_id, version.version),
                &version.id.to_string(),
            )?;
            version
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(version)
    }

    fn workspace_by_slug(&self, slug: &str) -> StoreResult<Option<Workspace>> {
        self.get_indexed(WORKSPACE_SLUGS_TABLE, WORKSPACES_TABLE, slug)
    }

    fn workflow_by_name(&self, workspace_id: WorkspaceId, name: &str) -> StoreResult<Option<Workflow>> {
        self.get_indexed(
            WORKFLOW_NAMES_TABLE,
            WORKFLOWS_TABLE,
            &format!("{}/{}", workspace_id, name),
        )
    }

    fn get_version(&self, version_id: VersionId) -> StoreResult<Option<WorkflowVersion>> {
        self.get(VERSIONS_TABLE, &version_id.to_string())
    }

    fn list_versions(&self, workflow_id: WorkflowId) -> StoreResult<Vec<WorkflowVersion>> {
        let ids: Vec<String> = self.scan(WORKFLOW_VERSIONS_TABLE, &format!("{}/", workflow_id))?;
        let mut versions = Vec::with_capacity(ids.len());
        for id in ids {
            let version = self
                .get(VERSIONS_TABLE, &id)?
                .ok_or_else(|| StoreError::Missing(format!("workflow version {}", id)))?;
            versions.push(version);
        }
        Ok(versions)
    }

    fn find_idempotency(&self, workspace_id: WorkspaceId, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        self.get(IDEMPOTENCY_TABLE, &idempotency_key(workspace_id, key))
    }

    fn create_run(&self, new_run: NewRun, timeout: Duration) -> StoreResult<RunCreation> {
        let started = Instant::now();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;

        // Re-check inside the write lock so concurrent requests sharing a key
        // cannot both create a run.
        let existing = match &new_run.idempotency {
            Some(record) => {
                let mut keys = write_txn.open_table(IDEMPOTENCY_TABLE).context("Failed to open table")?;
                let key = idempotency_key(record.workspace_id, &record.key);
                let found: Option<IdempotencyRecord> = read_json(&keys, &key)?;
                if found.is_none() {
                    write_json(&mut keys, &key, record)?;
                }
                found
            }
            None => None,
        };

        if let Some(found) = existing {
            write_txn.abort().context("Failed to abort transaction")?;
            let run = self
                .get_run(found.run_id)?
                .ok_or_else(|| StoreError::Missing(format!("run {}", found.run_id)))?;
            let steps = self.list_steps(run.id)?;
            return Ok(RunCreation::Existing { run, steps });
        }

        {
            let mut runs = write_txn.open_table(RUNS_TABLE).context("Failed to open table")?;
            let mut steps = write_txn.open_table(STEPS_TABLE).context("Failed to open table")?;
            let mut nodes = write_txn.open_table(RUN_NODES_TABLE).context("Failed to open table")?;
            let mut outbox = write_txn.open_table(OUTBOX_TABLE).context("Failed to open table")?;

            write_json(&mut runs, &new_run.run.id.to_string(), &new_run.run)?;
            for step in &new_run.steps {
                insert_step_rows(&mut steps, &mut nodes, step)?;
            }
            for entry in &new_run.outbox {
                write_json(&mut outbox, &entry.job_id, entry)?;
            }
        }

        if started.elapsed() > timeout {
            write_txn.abort().context("Failed to abort transaction")?;
            return Err(StoreError::TransactionTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        write_txn.commit().context("Failed to commit")?;
        Ok(RunCreation::Created {
            run: new_run.run,
            steps: new_run.steps,
        })
    }

    fn get_run(&self, run_id: RunId) -> StoreResult<Option<AgentRun>> {
        self.get(RUNS_TABLE, &run_id.to_string())
    }

    fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<AgentRun>> {
        let mut runs: Vec<AgentRun> = self.scan(RUNS_TABLE, "")?;
        if let Some(status) = status {
            runs.retain(|r| r.status == status);
        }

        // Most recent first
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    fn transition_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> StoreResult<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let changed = {
            let mut runs = write_txn.open_table(RUNS_TABLE).context("Failed to open table")?;
            let key = run_id.to_string();
            let run: Option<AgentRun> = read_json(&runs, &key)?;
            match run {
                None => return Err(StoreError::Missing(format!("run {}", run_id))),
                Some(mut run) if run.status == RunStatus::Running => {
                    run.status = status;
                    run.output = output;
                    run.error = error;
                    run.ended_at = Some(chrono::Utc::now());
                    write_json(&mut runs, &key, &run)?;
                    true
                }
                Some(_) => false,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(changed)
    }

    fn get_step(&self, run_id: RunId, step_id: StepId) -> StoreResult<Option<RunStep>> {
        self.get(STEPS_TABLE, &step_key(run_id, step_id))
    }

    fn list_steps(&self, run_id: RunId) -> StoreResult<Vec<RunStep>> {
        self.scan(STEPS_TABLE, &format!("{}/", run_id))
    }

    fn update_step(&self, step: &RunStep) -> StoreResult<()> {
        self.put(STEPS_TABLE, &step_key(step.run_id, step.id), step)
    }

    fn insert_step(&self, step: &RunStep, outbox: &OutboxEntry) -> StoreResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut steps = write_txn.open_table(STEPS_TABLE).context("Failed to open table")?;
            let mut nodes = write_txn.open_table(RUN_NODES_TABLE).context("Failed to open table")?;
            let mut pending = write_txn.open_table(OUTBOX_TABLE).context("Failed to open table")?;
            insert_step_rows(&mut steps, &mut nodes, step)?;
            write_json(&mut pending, &outbox.job_id, outbox)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn schedule_retry(&self, step: &RunStep, outbox: &OutboxEntry) -> StoreResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut steps = write_txn.open_table(STEPS_TABLE).context("Failed to open table")?;
            let mut pending = write_txn.open_table(OUTBOX_TABLE).context("Failed to open table")?;
            write_json(&mut steps, &step_key(step.run_id, step.id), step)?;
            write_json(&mut pending, &outbox.job_id, outbox)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn record_tool_execution(&self, execution: &ToolExecution) -> StoreResult<()> {
        let key = format!(
            "{}/{:020}/{}",
            execution.step_id,
            execution.created_at.timestamp_nanos_opt().unwrap_or_default(),
            execution.id
        );
        self.put(TOOL_EXECUTIONS_TABLE, &key, execution)
    }

    fn list_tool_executions(&self, step_id: StepId) -> StoreResult<Vec<ToolExecution>> {
        self.scan(TOOL_EXECUTIONS_TABLE, &format!("{}/", step_id))
    }

    fn pending_outbox(&self, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let mut entries: Vec<OutboxEntry> = self.scan(OUTBOX_TABLE, "")?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    fn remove_outbox(&self, job_id: &str) -> StoreResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(OUTBOX_TABLE).context("Failed to open table")?;
            table.remove(job_id).context("Failed to remove outbox entry")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepJob, Trigger, WorkflowNode};
    use tempfile::TempDir;

    fn store() -> (TempDir, RedbRunStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbRunStore::new(dir.path().join("runs.redb")).unwrap();
        (dir, store)
    }

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode {
            id: NodeId::new(id),
            node_type: "action".to_string(),
            connector: "core".to_string(),
            action: "echo".to_string(),
            config: serde_json::json!({"value": id}),
        }
    }

    fn run(workspace_id: WorkspaceId) -> AgentRun {
        AgentRun {
            id: RunId::new(),
            workflow_id: WorkflowId::new(),
            version_id: VersionId::new(),
            workspace_id,
            status: RunStatus::Running,
            trigger: Trigger::Manual,
            input: serde_json::json!({"x": 1}),
            output: None,
            error: None,
            started_at: chrono::Utc::now(),
            ended_at: None,
            idempotency_key: None,
        }
    }

    fn new_run(nodes: &[&str], key: Option<&str>) -> NewRun {
        let run = run(WorkspaceId::new());
        let steps: Vec<RunStep> = nodes
            .iter()
            .map(|n| RunStep::ready(run.id, &node(n), &run.input, 3))
            .collect();
        let outbox = steps
            .iter()
            .map(|s| OutboxEntry::new(StepJob::for_step(&run, &node(s.node_id.as_str()), s), 0))
            .collect();
        let idempotency = key.map(|k| IdempotencyRecord {
            key: k.to_string(),
            workspace_id: run.workspace_id,
            run_id: run.id,
            fingerprint: "f".to_string(),
            created_at: chrono::Utc::now(),
        });
        NewRun {
            run,
            steps,
            outbox,
            idempotency,
        }
    }

    #[test]
    fn test_create_run_persists_everything() {
        let (_dir, store) = store();
        let new_run = new_run(&["a", "b"], Some("k1"));
        let run_id = new_run.run.id;
        let workspace_id = new_run.run.workspace_id;

        let created = store.create_run(new_run, Duration::from_secs(20)).unwrap();
        assert!(matches!(created, RunCreation::Created { .. }));

        assert!(store.get_run(run_id).unwrap().is_some());
        assert_eq!(store.list_steps(run_id).unwrap().len(), 2);
        assert_eq!(store.pending_outbox(10).unwrap().len(), 2);
        assert_eq!(
            store.find_idempotency(workspace_id, "k1").unwrap().unwrap().run_id,
            run_id
        );
    }

    #[test]
    fn test_create_run_with_known_key_returns_existing() {
        let (_dir, store) = store();
        let first = new_run(&["a"], Some("k1"));
        let first_id = first.run.id;
        let workspace_id = first.run.workspace_id;
        store.create_run(first, Duration::from_secs(20)).unwrap();

        let mut second = new_run(&["a"], Some("k1"));
        second.run.workspace_id = workspace_id;
        if let Some(record) = second.idempotency.as_mut() {
            record.workspace_id = workspace_id;
        }
        let second_id = second.run.id;

        match store.create_run(second, Duration::from_secs(20)).unwrap() {
            RunCreation::Existing { run, steps } => {
                assert_eq!(run.id, first_id);
                assert_eq!(steps.len(), 1);
            }
            other => panic!("expected existing run, got {:?}", other),
        }
        assert!(store.get_run(second_id).unwrap().is_none());
        assert_eq!(store.list_runs(None).unwrap().len(), 1);
    }

    #[test]
    fn test_timed_out_transaction_leaves_nothing() {
        let (_dir, store) = store();
        let new_run = new_run(&["a"], Some("k1"));
        let run_id = new_run.run.id;
        let workspace_id = new_run.run.workspace_id;

        let err = store.create_run(new_run, Duration::ZERO).unwrap_err();
        assert!(matches!(err, StoreError::TransactionTimeout { .. }));

        assert!(store.get_run(run_id).unwrap().is_none());
        assert!(store.list_steps(run_id).unwrap().is_empty());
        assert!(store.pending_outbox(10).unwrap().is_empty());
        assert!(store.find_idempotency(workspace_id, "k1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let (_dir, store) = store();
        let new_run = new_run(&["a"], None);
        let agent_run = new_run.run.clone();
        store.create_run(new_run, Duration::from_secs(20)).unwrap();

        let step = RunStep::ready(agent_run.id, &node("a"), &agent_run.input, 3);
        let entry = OutboxEntry::new(StepJob::for_step(&agent_run, &node("a"), &step), 0);
        let err = store.insert_step(&step, &entry).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNode { .. }));

        // the losing insert wrote nothing
        assert_eq!(store.list_steps(agent_run.id).unwrap().len(), 1);
        assert!(store
            .pending_outbox(10)
            .unwrap()
            .iter()
            .all(|e| e.job_id != entry.job_id));

        let other = RunStep::ready(agent_run.id, &node("b"), &agent_run.input, 3);
        let entry = OutboxEntry::new(StepJob::for_step(&agent_run, &node("b"), &other), 0);
        store.insert_step(&other, &entry).unwrap();
        assert_eq!(store.list_steps(agent_run.id).unwrap().len(), 2);
    }

    #[test]
    fn test_transition_only_leaves_running_once() {
        let (_dir, store) = store();
        let new_run = new_run(&["a"], None);
        let run_id = new_run.run.id;
        store.create_run(new_run, Duration::from_secs(20)).unwrap();

        assert!(store
            .transition_run(run_id, RunStatus::Failed, None, Some("boom".into()))
            .unwrap());
        assert!(!store
            .transition_run(run_id, RunStatus::Completed, Some(serde_json::json!(1)), None)
            .unwrap());

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.ended_at.is_some());

        assert!(matches!(
            store.transition_run(RunId::new(), RunStatus::Failed, None, None),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn test_steps_scoped_to_run() {
        let (_dir, store) = store();
        let first = new_run(&["a", "b"], None);
        let second = new_run(&["a"], None);
        let (first_id, second_id) = (first.run.id, second.run.id);
        store.create_run(first, Duration::from_secs(20)).unwrap();
        store.create_run(second, Duration::from_secs(20)).unwrap();

        assert_eq!(store.list_steps(first_id).unwrap().len(), 2);
        assert_eq!(store.list_steps(second_id).unwrap().len(), 1);
        assert_eq!(store.list_runs(Some(RunStatus::Running)).unwrap().len(), 2);
        assert!(store.list_runs(Some(RunStatus::Failed)).unwrap().is_empty());
    }

    #[test]
    fn test_outbox_remove() {
        let (_dir, store) = store();
        store.create_run(new_run(&["a", "b"], None), Duration::from_secs(20)).unwrap();

        let pending = store.pending_outbox(1).unwrap();
        assert_eq!(pending.len(), 1);
        store.remove_outbox(&pending[0].job_id).unwrap();
        assert_eq!(store.pending_outbox(10).unwrap().len(), 1);
    }

    #[test]
    fn test_catalog_lookups() {
        let (_dir, store) = store();
        let first = store.publish_version("acme", "onboarding", Default::default()).unwrap();
        let second = store.publish_version("acme", "onboarding", Default::default()).unwrap();
        let other = store.publish_version("acme", "billing", Default::default()).unwrap();

        let workspace = store.workspace_by_slug("acme").unwrap().unwrap();
        assert!(store.workspace_by_slug("other").unwrap().is_none());
        let workflow = store.workflow_by_name(workspace.id, "onboarding").unwrap().unwrap();
        assert_eq!(workflow.id, first.workflow_id);
        assert_eq!(second.workflow_id, first.workflow_id);
        assert_ne!(other.workflow_id, first.workflow_id);
        assert_eq!(other.version, 1);

        let versions = store.list_versions(workflow.id).unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.get_version(second.id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_concurrent_publishes_share_catalog_rows() {
        let (_dir, store) = store();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.publish_version("acme", "sync", Default::default()).unwrap()
                })
            })
            .collect();
        let published: Vec<WorkflowVersion> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut numbers: Vec<u32> = published.iter().map(|v| v.version).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=8).collect::<Vec<u32>>());
        assert!(published.iter().all(|v| v.workflow_id == published[0].workflow_id));

        let workspaces: Vec<Workspace> = store.scan(WORKSPACES_TABLE, "").unwrap();
        assert_eq!(workspaces.len(), 1);
        let workflows: Vec<Workflow> = store.scan(WORKFLOWS_TABLE, "").unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(store.list_versions(published[0].workflow_id).unwrap().len(), 8);
    }
}
