//! Error taxonomy for the run engine.

use crate::types::{NodeId, RunId};

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the orchestrator, worker and connector layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Workspace, workflow, run, step or node absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Cycle, duplicate node or dangling edge reference.
    #[error("invalid DAG: {0}")]
    InvalidDag(String),

    /// Payload rejected by the action's input type. Never retried.
    #[error("validation failed for {connector}.{action}: {message}")]
    Validation {
        connector: String,
        action: String,
        message: String,
    },

    #[error("connector {0} is already registered")]
    DuplicateConnector(String),

    #[error("failed to enqueue job {job_id}: {message}")]
    EnqueueFailure { job_id: String, message: String },

    /// Handler failed, possibly after exhausting rate-limit retries.
    #[error("{connector}.{action} failed after {attempts} attempt(s): {message}")]
    ConnectorExecution {
        connector: String,
        action: String,
        attempts: u32,
        message: String,
    },

    #[error("transaction exceeded {timeout_ms}ms")]
    TransactionTimeout { timeout_ms: u64 },

    #[error("queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    /// Failures that cannot succeed on a later attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::InvalidDag(_) | Self::Validation { .. }
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransactionTimeout { timeout_ms } => Self::TransactionTimeout { timeout_ms },
            other => Self::Store(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a `RunStore`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint on `(run_id, node_id)`.
    #[error("run {run_id} already has a step for node {node_id}")]
    DuplicateNode { run_id: RunId, node_id: NodeId },

    #[error("transaction exceeded {timeout_ms}ms and was rolled back")]
    TransactionTimeout { timeout_ms: u64 },

    #[error("{0} not found")]
    Missing(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_timeout_maps_to_engine_timeout() {
        let err: EngineError = StoreError::TransactionTimeout { timeout_ms: 20 }.into();
        assert!(matches!(err, EngineError::TransactionTimeout { timeout_ms: 20 }));
    }

    #[test]
    fn test_permanent_errors() {
        assert!(EngineError::not_found("run x").is_permanent());
        assert!(!EngineError::Queue("closed".into()).is_permanent());
        assert!(!EngineError::ConnectorExecution {
            connector: "http".into(),
            action: "request".into(),
            attempts: 3,
            message: "boom".into(),
        }
        .is_permanent());
    }
}
