pub mod catalog;
pub mod dag;
pub mod dispatcher;
pub mod engine;
pub mod orchestrator;
pub mod progress;
pub mod reconciler;
pub mod worker;

pub use catalog::{publish_workflow, resolve_workflow, ResolvedWorkflow};
pub use dag::{initial_node_ids, next_ready_node_ids, terminal_node_ids, validate_dag};
pub use dispatcher::OutboxDispatcher;
pub use engine::{Engine, EngineHandles};
pub use orchestrator::{request_fingerprint, OrchestrateRequest, OrchestrateResponse, Orchestrator};
pub use reconciler::{ReconcileReport, Reconciler};
pub use worker::{merge_payload, StepOutcome, StepProcessor, WorkerPool};
