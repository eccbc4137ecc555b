// Frontier advancement and run completion, shared by the worker and the reconciler

use super::dag::{next_ready_node_ids, terminal_node_ids};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::metrics::{MetricsCollector, RUNS_COMPLETED};
use crate::storage::RunStore;
use crate::types::{AgentRun, NodeId, OutboxEntry, RunStatus, RunStep, StepJob, StepStatus, WorkflowDag};
use std::collections::{HashMap, HashSet};

/// Create a `ready` step (and its outbox row) for every node whose
/// dependencies have all succeeded and that has no step yet. Returns the
/// outbox rows written.
///
/// A node claimed concurrently by another worker surfaces as
/// `DuplicateNode` and is skipped.
pub fn schedule_ready_steps(
    store: &dyn RunStore,
    run: &AgentRun,
    dag: &WorkflowDag,
    steps: &[RunStep],
    max_attempts: u32,
) -> EngineResult<Vec<OutboxEntry>> {
    let completed: HashSet<NodeId> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| s.node_id.clone())
        .collect();
    let existing: HashSet<NodeId> = steps.iter().map(|s| s.node_id.clone()).collect();

    let mut scheduled = Vec::new();
    for node_id in next_ready_node_ids(dag, &completed, &existing) {
        let node = dag
            .node(&node_id)
            .ok_or_else(|| EngineError::not_found(format!("node {}", node_id)))?;

        let step = RunStep::ready(run.id, node, &run.input, max_attempts);
        let entry = OutboxEntry::new(StepJob::for_step(run, node, &step), step.attempt);

        match store.insert_step(&step, &entry) {
            Ok(()) => {
                tracing::debug!(run_id = %run.id, node_id = %node_id, step_id = %step.id, "Scheduled step");
                scheduled.push(entry);
            }
            Err(StoreError::DuplicateNode { run_id, node_id }) => {
                tracing::warn!(
                    run_id = %run_id,
                    node_id = %node_id,
                    "Step already created by a concurrent worker"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(scheduled)
}

/// Run output: the terminal step's output, or an object keyed by node id
/// when the DAG has several terminal nodes.
pub fn collect_output(dag: &WorkflowDag, steps: &[RunStep]) -> Option<serde_json::Value> {
    let succeeded: HashMap<&NodeId, &RunStep> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| (&s.node_id, s))
        .collect();

    let terminals = terminal_node_ids(dag);
    let mut outputs = serde_json::Map::new();
    for node_id in &terminals {
        let step = succeeded.get(node_id)?;
        outputs.insert(
            node_id.to_string(),
            step.output.clone().unwrap_or(serde_json::Value::Null),
        );
    }

    if terminals.len() == 1 {
        outputs.into_iter().next().map(|(_, output)| output)
    } else {
        Some(serde_json::Value::Object(outputs))
    }
}

/// Complete the run when nothing is pending and every terminal node
/// succeeded. Returns true if this call moved the run to `completed`.
pub fn try_complete_run(
    store: &dyn RunStore,
    metrics: &MetricsCollector,
    run: &AgentRun,
    dag: &WorkflowDag,
) -> EngineResult<bool> {
    let steps = store.list_steps(run.id)?;
    if steps.iter().any(|s| s.status.is_pending()) {
        return Ok(false);
    }

    let Some(output) = collect_output(dag, &steps) else {
        return Ok(false);
    };

    let completed = store.transition_run(run.id, RunStatus::Completed, Some(output), None)?;
    if completed {
        metrics.increment_counter(RUNS_COMPLETED, &[]);
        tracing::info!(run_id = %run.id, "Run completed");
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WorkflowEdge, WorkflowNode};

    fn dag(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowDag {
        WorkflowDag {
            nodes: nodes
                .iter()
                .map(|id| WorkflowNode {
                    id: NodeId::new(*id),
                    node_type: "action".to_string(),
                    connector: "core".to_string(),
                    action: "echo".to_string(),
                    config: serde_json::Value::Null,
                })
                .collect(),
            edges: edges.iter().map(|(f, t)| WorkflowEdge::new(*f, *t)).collect(),
        }
    }

    fn succeeded(dag: &WorkflowDag, id: &str, output: serde_json::Value) -> RunStep {
        let node = dag.node(&NodeId::new(id)).unwrap();
        let mut step = RunStep::ready(crate::types::RunId::new(), node, &serde_json::Value::Null, 3);
        step.status = StepStatus::Succeeded;
        step.output = Some(output);
        step
    }

    #[test]
    fn test_single_terminal_output_is_unwrapped() {
        let dag = dag(&["a", "b"], &[("a", "b")]);
        let steps = vec![
            succeeded(&dag, "a", serde_json::json!(1)),
            succeeded(&dag, "b", serde_json::json!(2)),
        ];
        assert_eq!(collect_output(&dag, &steps), Some(serde_json::json!(2)));
    }

    #[test]
    fn test_multiple_terminals_are_aggregated() {
        let dag = dag(&["a", "b", "c"], &[("a", "b"), ("a", "c")]);
        let mut steps = vec![
            succeeded(&dag, "a", serde_json::json!(1)),
            succeeded(&dag, "b", serde_json::json!("left")),
        ];
        assert_eq!(collect_output(&dag, &steps), None);

        steps.push(succeeded(&dag, "c", serde_json::json!("right")));
        assert_eq!(
            collect_output(&dag, &steps),
            Some(serde_json::json!({"b": "left", "c": "right"}))
        );
    }

    #[test]
    fn test_dead_lettered_terminal_blocks_output() {
        let dag = dag(&["a", "b"], &[("a", "b")]);
        let mut failed = succeeded(&dag, "b", serde_json::Value::Null);
        failed.status = StepStatus::Dlq;
        let steps = vec![succeeded(&dag, "a", serde_json::json!(1)), failed];
        assert_eq!(collect_output(&dag, &steps), None);
    }
}
