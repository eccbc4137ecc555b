use super::dispatcher::OutboxDispatcher;
use super::progress::{schedule_ready_steps, try_complete_run};
use crate::config::{EngineConfig, StepRetryMode};
use crate::connector::{ConnectorExecutor, ExecutionContext};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{
    MetricsCollector, RUNS_FAILED, STEPS_FAILED, STEPS_RETRIED, STEPS_STARTED, STEPS_SUCCEEDED,
    STEP_DURATION_SECONDS,
};
use crate::queue::{JobQueue, QueuedJob};
use crate::storage::RunStore;
use crate::types::{
    AgentRun, OutboxEntry, RunStatus, RunStep, StepJob, StepStatus, ToolExecution,
    ToolExecutionId, WorkflowDag,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What processing a job did
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded,
    /// The attempt failed and the next one was queued
    Retrying { attempt: u32, error: String },
    /// Delivered again after the step moved on; acked without running
    Skipped(String),
}

/// Connector payload for a step: run input overlaid with the node config.
/// Non-object values are replaced, object keys from `config` win.
pub fn merge_payload(input: &serde_json::Value, config: &serde_json::Value) -> serde_json::Value {
    match (input, config) {
        (serde_json::Value::Object(input), serde_json::Value::Object(config)) => {
            let mut merged = input.clone();
            for (key, value) in config {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        (input, serde_json::Value::Null) => input.clone(),
        (_, config) => config.clone(),
    }
}

/// Executes queued step jobs and advances their run
pub struct StepProcessor {
    store: Arc<dyn RunStore>,
    executor: ConnectorExecutor,
    queue: Arc<dyn JobQueue>,
    dispatcher: OutboxDispatcher,
    metrics: MetricsCollector,
    config: EngineConfig,
}

impl StepProcessor {
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: ConnectorExecutor,
        queue: Arc<dyn JobQueue>,
        dispatcher: OutboxDispatcher,
        metrics: MetricsCollector,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            queue,
            dispatcher,
            metrics,
            config,
        }
    }

    /// Process one delivery of `job`.
    ///
    /// A terminal failure dead-letters the step, fails the run, mirrors the
    /// job onto the dead-letter queue and returns the error.
    pub async fn process(&self, job: &StepJob) -> EngineResult<StepOutcome> {
        let run = self
            .store
            .get_run(job.run_id)?
            .ok_or_else(|| EngineError::not_found(format!("run {}", job.run_id)))?;
        let version = self
            .store
            .get_version(run.version_id)?
            .ok_or_else(|| EngineError::not_found(format!("workflow version {}", run.version_id)))?;
        let mut step = self
            .store
            .get_step(job.run_id, job.step_id)?
            .ok_or_else(|| EngineError::not_found(format!("step {}", job.step_id)))?;

        if step.status.is_terminal() {
            return Ok(StepOutcome::Skipped(format!("step already {:?}", step.status)));
        }
        if job.attempt() < step.attempt {
            return Ok(StepOutcome::Skipped(format!(
                "stale attempt {} (step is on attempt {})",
                job.attempt(),
                step.attempt
            )));
        }
        if run.status != RunStatus::Running {
            return Ok(StepOutcome::Skipped(format!("run already {:?}", run.status)));
        }

        match self.execute_step(&run, &version.dag, &mut step, job).await {
            Ok(()) => Ok(StepOutcome::Succeeded),
            Err(err) => self.handle_failure(&run, &mut step, job, err).await,
        }
    }

    /// Process a delivery and settle it on the queue: ack on success or
    /// skip, fail on a retried or dead-lettered attempt.
    pub async fn handle(&self, queued: &QueuedJob) -> EngineResult<StepOutcome> {
        let result = self.process(&queued.job).await;
        let bookkeeping = match &result {
            Ok(StepOutcome::Retrying { error, .. }) => self.queue.fail(&queued.job_id, error).await,
            Ok(StepOutcome::Skipped(reason)) => {
                tracing::debug!("Skipped job {}: {}", queued.job_id, reason);
                self.queue.ack(&queued.job_id).await
            }
            Ok(StepOutcome::Succeeded) => self.queue.ack(&queued.job_id).await,
            Err(e) => self.queue.fail(&queued.job_id, &e.to_string()).await,
        };
        if let Err(e) = bookkeeping {
            tracing::warn!("Queue bookkeeping failed for job {}: {}", queued.job_id, e);
        }
        result
    }

    async fn execute_step(
        &self,
        run: &AgentRun,
        dag: &WorkflowDag,
        step: &mut RunStep,
        job: &StepJob,
    ) -> EngineResult<()> {
        if dag.node(&step.node_id).is_none() {
            return Err(EngineError::not_found(format!("node {}", step.node_id)));
        }

        let labels = [("connector", job.connector.as_str())];
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.ended_at = None;
        self.store.update_step(step)?;
        self.metrics.increment_counter(STEPS_STARTED, &labels);

        let payload = merge_payload(&job.payload.input, &job.payload.config);
        let span = tracing::info_span!(
            "step",
            workspace_id = %run.workspace_id,
            run_id = %run.id,
            step_id = %step.id,
            node_id = %step.node_id,
            attempt = step.attempt
        );
        let ctx = ExecutionContext {
            workspace_id: run.workspace_id,
            run_id: run.id,
            step_id: step.id,
            span,
            credential: self.config.credentials.get(&job.connector).cloned(),
        };

        let started = Instant::now();
        let result = self
            .executor
            .execute(&job.connector, &job.action, &ctx, payload.clone())
            .await;
        let elapsed = started.elapsed();
        self.metrics
            .observe_histogram(STEP_DURATION_SECONDS, elapsed.as_secs_f64(), &labels);

        let execution = ToolExecution {
            id: ToolExecutionId::new(),
            step_id: step.id,
            run_id: run.id,
            connector: job.connector.clone(),
            action: job.action.clone(),
            request: payload,
            response: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            duration_ms: elapsed.as_millis() as u64,
            created_at: Utc::now(),
        };

        let output = match result {
            Ok(output) => {
                self.store.record_tool_execution(&execution)?;
                output
            }
            Err(err) => {
                if let Err(e) = self.store.record_tool_execution(&execution) {
                    tracing::warn!(parent: &ctx.span, "Failed to record tool execution: {}", e);
                }
                return Err(err);
            }
        };

        step.status = StepStatus::Succeeded;
        step.output = Some(output);
        step.error = None;
        step.ended_at = Some(Utc::now());
        self.store.update_step(step)?;
        self.metrics.increment_counter(STEPS_SUCCEEDED, &labels);
        tracing::debug!(parent: &ctx.span, "Step succeeded in {}ms", execution.duration_ms);

        // The step's success is already committed; a crash from here on leaves
        // an orphaned frontier for the reconciler.
        let steps = self.store.list_steps(run.id)?;
        let scheduled = schedule_ready_steps(
            self.store.as_ref(),
            run,
            dag,
            &steps,
            self.config.effective_max_attempts(),
        )?;
        self.dispatcher.dispatch_or_defer(&scheduled).await;

        try_complete_run(self.store.as_ref(), &self.metrics, run, dag)?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        run: &AgentRun,
        step: &mut RunStep,
        job: &StepJob,
        err: EngineError,
    ) -> EngineResult<StepOutcome> {
        let message = err.to_string();
        self.metrics
            .increment_counter(STEPS_FAILED, &[("connector", job.connector.as_str())]);

        let retryable = self.config.step_retry == StepRetryMode::Bounded && !err.is_permanent();
        if retryable && step.attempt + 1 < step.max_attempts {
            let mut retry = step.clone();
            retry.attempt += 1;
            retry.status = StepStatus::Retrying;
            retry.error = Some(message.clone());
            retry.ended_at = Some(Utc::now());

            let entry = OutboxEntry::new(job.for_attempt(retry.attempt), retry.attempt);
            match self.store.schedule_retry(&retry, &entry) {
                Ok(()) => {
                    *step = retry;
                    self.metrics.increment_counter(STEPS_RETRIED, &[]);
                    tracing::warn!(
                        run_id = %run.id,
                        step_id = %step.id,
                        attempt = step.attempt,
                        max_attempts = step.max_attempts,
                        "Step failed, retrying: {}",
                        message
                    );

                    self.dispatcher.dispatch_or_defer(std::slice::from_ref(&entry)).await;
                    return Ok(StepOutcome::Retrying {
                        attempt: step.attempt,
                        error: message,
                    });
                }
                // Nothing would ever deliver the next attempt; dead-letter instead
                Err(e) => tracing::error!(
                    run_id = %run.id,
                    step_id = %step.id,
                    "Failed to schedule retry, dead-lettering: {}",
                    e
                ),
            }
        }

        step.status = StepStatus::Dlq;
        step.error = Some(message.clone());
        step.ended_at = Some(Utc::now());
        if let Err(e) = self.store.update_step(step) {
            tracing::error!("Failed to dead-letter step {}: {}", step.id, e);
        }

        match self
            .store
            .transition_run(run.id, RunStatus::Failed, None, Some(message.clone()))
        {
            Ok(true) => self.metrics.increment_counter(RUNS_FAILED, &[]),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to mark run {} failed: {}", run.id, e),
        }

        if let Err(e) = self.queue.dead_letter(job.clone(), &message).await {
            tracing::error!("Failed to publish job for step {} to the DLQ: {}", step.id, e);
        }

        tracing::error!(
            run_id = %run.id,
            step_id = %step.id,
            node_id = %step.node_id,
            "Step dead-lettered: {}",
            message
        );
        Err(err)
    }
}

/// Fixed-size pool of workers consuming the step queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        processor: Arc<StepProcessor>,
        queue: Arc<dyn JobQueue>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..concurrency.max(1))
            .map(|worker| {
                let processor = processor.clone();
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    Self::work(worker, processor, queue, cancel).await;
                })
            })
            .collect();

        Self { handles }
    }

    async fn work(
        worker: usize,
        processor: Arc<StepProcessor>,
        queue: Arc<dyn JobQueue>,
        cancel: CancellationToken,
    ) {
        tracing::debug!("Worker {} started", worker);
        loop {
            let queued = tokio::select! {
                _ = cancel.cancelled() => break,
                queued = queue.dequeue() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            // Errors are already recorded on the queue
            let _ = processor.handle(&queued).await;
        }
        tracing::debug!("Worker {} stopped", worker);
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to stop
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_config_overrides_input() {
        let merged = merge_payload(
            &serde_json::json!({"url": "https://a", "n": 1}),
            &serde_json::json!({"url": "https://b"}),
        );
        assert_eq!(merged, serde_json::json!({"url": "https://b", "n": 1}));
    }

    #[test]
    fn test_merge_non_objects() {
        assert_eq!(
            merge_payload(&serde_json::json!([1]), &serde_json::Value::Null),
            serde_json::json!([1])
        );
        assert_eq!(
            merge_payload(&serde_json::Value::Null, &serde_json::json!({"value": 2})),
            serde_json::json!({"value": 2})
        );
    }
}
