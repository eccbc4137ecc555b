use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, WorkflowDag};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Fails with `InvalidDag` on duplicate ids, dangling edges or cycles.
pub fn validate_dag(dag: &WorkflowDag) -> EngineResult<()> {
    let mut graph: DiGraph<&NodeId, ()> = DiGraph::new();
    let mut indices: HashMap<&NodeId, NodeIndex> = HashMap::new();

    for node in &dag.nodes {
        let idx = graph.add_node(&node.id);
        if indices.insert(&node.id, idx).is_some() {
            return Err(EngineError::InvalidDag(format!(
                "duplicate node id {}",
                node.id
            )));
        }
    }

    for edge in &dag.edges {
        let from = indices.get(&edge.from).ok_or_else(|| {
            EngineError::InvalidDag(format!(
                "edge {} -> {} references unknown node {}",
                edge.from, edge.to, edge.from
            ))
        })?;
        let to = indices.get(&edge.to).ok_or_else(|| {
            EngineError::InvalidDag(format!(
                "edge {} -> {} references unknown node {}",
                edge.from, edge.to, edge.to
            ))
        })?;

        // Edge from dependency to dependent
        graph.add_edge(*from, *to, ());
    }

    // toposort is a DFS; a back edge yields the offending node
    if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
        return Err(EngineError::InvalidDag(format!(
            "cycle detected at node {}",
            graph[cycle.node_id()]
        )));
    }

    Ok(())
}

/// Nodes with zero incoming edges, in declaration order.
pub fn initial_node_ids(dag: &WorkflowDag) -> Vec<NodeId> {
    let targets: HashSet<&NodeId> = dag.edges.iter().map(|e| &e.to).collect();
    dag.nodes
        .iter()
        .filter(|n| !targets.contains(&n.id))
        .map(|n| n.id.clone())
        .collect()
}

/// Nodes with zero outgoing edges, in declaration order.
pub fn terminal_node_ids(dag: &WorkflowDag) -> Vec<NodeId> {
    let sources: HashSet<&NodeId> = dag.edges.iter().map(|e| &e.from).collect();
    dag.nodes
        .iter()
        .filter(|n| !sources.contains(&n.id))
        .map(|n| n.id.clone())
        .collect()
}

/// Every node whose full dependency set is in `completed` and which has no
/// step in `existing` yet. Pure; used for both the initial and incremental case.
pub fn next_ready_node_ids(
    dag: &WorkflowDag,
    completed: &HashSet<NodeId>,
    existing: &HashSet<NodeId>,
) -> Vec<NodeId> {
    let mut dependencies: HashMap<&NodeId, HashSet<&NodeId>> = HashMap::new();
    for edge in &dag.edges {
        dependencies.entry(&edge.to).or_default().insert(&edge.from);
    }

    dag.nodes
        .iter()
        .filter(|n| !existing.contains(&n.id))
        .filter(|n| {
            dependencies
                .get(&n.id)
                .map_or(true, |deps| deps.iter().all(|d| completed.contains(*d)))
        })
        .map(|n| n.id.clone())
        .collect()
}
