use super::dag::validate_dag;
use crate::error::{EngineError, EngineResult};
use crate::storage::RunStore;
use crate::types::{Workflow, WorkflowDag, WorkflowVersion, Workspace};

/// Validate `dag` and append it as the next published version of
/// `workflow_name`, creating the workspace and workflow on first use.
pub fn publish_workflow(
    store: &dyn RunStore,
    workspace_slug: &str,
    workflow_name: &str,
    dag: WorkflowDag,
) -> EngineResult<WorkflowVersion> {
    validate_dag(&dag)?;

    let version = store.publish_version(workspace_slug, workflow_name, dag)?;

    tracing::info!(
        workspace = workspace_slug,
        workflow = workflow_name,
        version = version.version,
        "Published workflow version"
    );
    Ok(version)
}

/// Workspace, workflow and its latest published version
pub struct ResolvedWorkflow {
    pub workspace: Workspace,
    pub workflow: Workflow,
    pub version: WorkflowVersion,
}

pub fn resolve_workflow(
    store: &dyn RunStore,
    workspace_slug: &str,
    workflow_name: &str,
) -> EngineResult<ResolvedWorkflow> {
    let workspace = store
        .workspace_by_slug(workspace_slug)?
        .ok_or_else(|| EngineError::not_found(format!("workspace {}", workspace_slug)))?;

    let workflow = store
        .workflow_by_name(workspace.id, workflow_name)?
        .ok_or_else(|| EngineError::not_found(format!("workflow {}", workflow_name)))?;

    let version = store
        .list_versions(workflow.id)?
        .into_iter()
        .rev()
        .find(|v| v.published)
        .ok_or_else(|| {
            EngineError::not_found(format!("published version of workflow {}", workflow_name))
        })?;

    Ok(ResolvedWorkflow {
        workspace,
        workflow,
        version,
    })
}
