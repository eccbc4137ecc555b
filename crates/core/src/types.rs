use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a workspace
    WorkspaceId
);
uuid_id!(
    /// Unique identifier for a workflow
    WorkflowId
);
uuid_id!(
    /// Unique identifier for a published workflow version
    VersionId
);
uuid_id!(
    /// Unique identifier for a workflow run
    RunId
);
uuid_id!(
    /// Unique identifier for a run step
    StepId
);
uuid_id!(ToolExecutionId);

/// Identifier of a node inside a workflow DAG
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant that owns workflows and runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: WorkspaceId,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

/// A named workflow inside a workspace; its DAGs live in versions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable published DAG of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    pub id: VersionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub dag: WorkflowDag,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

/// Directed acyclic graph of typed actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDag {
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDag {
    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    pub connector: String,
    pub action: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_node_type() -> String {
    "action".to_string()
}

/// Dependency edge: `to` runs only after `from` succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: NodeId,
    pub to: NodeId,
}

impl WorkflowEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: NodeId::new(from),
            to: NodeId::new(to),
        }
    }
}

/// Persisted status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Status vocabulary exposed to clients of `orchestrate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ClientRunStatus {
    /// A running run whose steps have not started yet is still queued.
    pub fn project(status: RunStatus, steps: &[RunStep]) -> Self {
        match status {
            RunStatus::Completed => Self::Completed,
            RunStatus::Failed => Self::Failed,
            RunStatus::Running => {
                if steps.iter().all(|s| s.status == StepStatus::Ready && s.started_at.is_none()) {
                    Self::Queued
                } else {
                    Self::Running
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Schedule,
    Webhook,
}

/// One execution of a workflow version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub version_id: VersionId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
    pub trigger: Trigger,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// Status of a run step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ready,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Dlq,
}

impl StepStatus {
    /// Steps in these states still owe the run some work.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dlq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub payload: serde_json::Value,
    pub config: serde_json::Value,
}

/// One instantiated DAG node within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: StepId,
    pub run_id: RunId,
    pub node_id: NodeId,
    #[serde(rename = "type")]
    pub step_type: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub input: StepInput,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunStep {
    /// A fresh `ready` step for `node` carrying the run input.
    pub fn ready(
        run_id: RunId,
        node: &WorkflowNode,
        input: &serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: StepId::new(),
            run_id,
            node_id: node.id.clone(),
            step_type: node.node_type.clone(),
            status: StepStatus::Ready,
            attempt: 0,
            max_attempts,
            input: StepInput {
                payload: input.clone(),
                config: node.config.clone(),
            },
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Maps a caller-supplied key to the run it created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub workspace_id: WorkspaceId,
    pub run_id: RunId,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row for one connector action invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub id: ToolExecutionId,
    pub step_id: StepId,
    pub run_id: RunId,
    pub connector: String,
    pub action: String,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub input: serde_json::Value,
    pub config: serde_json::Value,
}

/// Queue message for one step attempt. Dead-lettered verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepJob {
    pub run_id: RunId,
    pub step_id: StepId,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub node_id: NodeId,
    pub connector: String,
    pub action: String,
    pub payload: JobPayload,
    pub idempotency_key: String,
}

impl StepJob {
    pub fn for_step(run: &AgentRun, node: &WorkflowNode, step: &RunStep) -> Self {
        Self {
            run_id: run.id,
            step_id: step.id,
            workflow_id: run.workflow_id,
            workspace_id: run.workspace_id,
            node_id: node.id.clone(),
            connector: node.connector.clone(),
            action: node.action.clone(),
            payload: JobPayload {
                input: step.input.payload.clone(),
                config: step.input.config.clone(),
            },
            idempotency_key: format!("{}:attempt:{}", step.id, step.attempt),
        }
    }

    /// The same job re-keyed for another attempt of its step
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            idempotency_key: format!("{}:attempt:{}", self.step_id, attempt),
            ..self.clone()
        }
    }

    /// Attempt number encoded in the idempotency key.
    pub fn attempt(&self) -> u32 {
        self.idempotency_key
            .rsplit(':')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// A job waiting to be handed to the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub job_id: String,
    pub job: StepJob,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(job: StepJob, attempt: u32) -> Self {
        Self {
            job_id: format!("{}:{}", job.step_id, attempt),
            job,
            created_at: Utc::now(),
        }
    }
}
