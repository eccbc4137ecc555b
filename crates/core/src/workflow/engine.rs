use super::catalog::publish_workflow;
use super::dispatcher::OutboxDispatcher;
use super::orchestrator::{OrchestrateRequest, OrchestrateResponse, Orchestrator};
use super::reconciler::{ReconcileReport, Reconciler};
use super::worker::{StepProcessor, WorkerPool};
use crate::config::EngineConfig;
use crate::connector::{ConnectorExecutor, ConnectorRegistry};
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsCollector;
use crate::queue::JobQueue;
use crate::storage::RunStore;
use crate::types::{AgentRun, RunId, RunStep, StepId, ToolExecution, WorkflowDag, WorkflowVersion};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The run engine: orchestrator, worker pool, outbox dispatcher and
/// reconciler over one store, registry and queue.
pub struct Engine {
    store: Arc<dyn RunStore>,
    registry: Arc<ConnectorRegistry>,
    queue: Arc<dyn JobQueue>,
    metrics: MetricsCollector,
    config: EngineConfig,
    orchestrator: Orchestrator,
    processor: Arc<StepProcessor>,
    dispatcher: OutboxDispatcher,
    reconciler: Arc<Reconciler>,
}

/// Background tasks started by `Engine::start`
pub struct EngineHandles {
    pub pool: WorkerPool,
    background: Vec<JoinHandle<()>>,
}

impl EngineHandles {
    pub async fn join(self) {
        self.pool.join().await;
        for handle in self.background {
            if let Err(e) = handle.await {
                tracing::error!("Engine task failed: {}", e);
            }
        }
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<ConnectorRegistry>,
        queue: Arc<dyn JobQueue>,
        config: EngineConfig,
    ) -> Self {
        let metrics = MetricsCollector::new();
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            queue.clone(),
            metrics.clone(),
            config.dispatch_batch_size,
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            dispatcher.clone(),
            metrics.clone(),
            config.clone(),
        );
        let processor = Arc::new(StepProcessor::new(
            store.clone(),
            ConnectorExecutor::new(registry.clone()),
            queue.clone(),
            dispatcher.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            dispatcher.clone(),
            metrics.clone(),
            config.clone(),
        ));

        Self {
            store,
            registry,
            queue,
            metrics,
            config,
            orchestrator,
            processor,
            dispatcher,
            reconciler,
        }
    }

    /// Spawn the worker pool, the outbox dispatcher and the reconciler
    pub fn start(&self, cancel: CancellationToken) -> EngineHandles {
        let pool = WorkerPool::spawn(
            self.processor.clone(),
            self.queue.clone(),
            self.config.worker_concurrency,
            cancel.clone(),
        );

        let dispatcher = tokio::spawn(
            self.dispatcher
                .clone()
                .run(self.config.dispatch_interval(), cancel.clone()),
        );
        let reconciler = tokio::spawn(
            self.reconciler
                .clone()
                .run(self.config.reconcile_interval(), cancel),
        );

        tracing::info!("Engine started with {} workers", pool.size());
        EngineHandles {
            pool,
            background: vec![dispatcher, reconciler],
        }
    }

    pub async fn orchestrate(&self, request: OrchestrateRequest) -> EngineResult<OrchestrateResponse> {
        self.orchestrator.orchestrate(request).await
    }

    pub fn publish_workflow(
        &self,
        workspace_slug: &str,
        workflow_name: &str,
        dag: WorkflowDag,
    ) -> EngineResult<WorkflowVersion> {
        publish_workflow(self.store.as_ref(), workspace_slug, workflow_name, dag)
    }

    pub fn run_details(&self, run_id: RunId) -> EngineResult<(AgentRun, Vec<RunStep>)> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::not_found(format!("run {}", run_id)))?;
        let steps = self.store.list_steps(run_id)?;
        Ok((run, steps))
    }

    pub fn tool_executions(&self, run_id: RunId, step_id: StepId) -> EngineResult<Vec<ToolExecution>> {
        if self.store.get_step(run_id, step_id)?.is_none() {
            return Err(EngineError::not_found(format!("step {} of run {}", step_id, run_id)));
        }
        Ok(self.store.list_tool_executions(step_id)?)
    }

    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        self.reconciler.reconcile().await
    }

    pub fn processor(&self) -> &StepProcessor {
        &self.processor
    }

    pub fn dispatcher(&self) -> &OutboxDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn store(&self) -> &dyn RunStore {
        self.store.as_ref()
    }
}
