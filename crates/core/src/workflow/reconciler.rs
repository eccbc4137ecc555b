use super::dispatcher::OutboxDispatcher;
use super::progress::{schedule_ready_steps, try_complete_run};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::metrics::MetricsCollector;
use crate::storage::RunStore;
use crate::types::{AgentRun, OutboxEntry, RunStatus, StepJob};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub runs_checked: usize,
    pub steps_created: usize,
    pub runs_completed: usize,
    /// Jobs re-offered for steps that were already ready, running or retrying
    pub jobs_redelivered: usize,
    pub outbox_delivered: usize,
}

struct RunRepair {
    created: usize,
    completed: bool,
    pending: Vec<OutboxEntry>,
}

/// Repairs running runs the workers lost track of: frontiers never
/// advanced after a crash between marking a step succeeded and scheduling
/// its dependents, and pending steps whose job vanished with the queue.
pub struct Reconciler {
    store: Arc<dyn RunStore>,
    dispatcher: OutboxDispatcher,
    metrics: MetricsCollector,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RunStore>,
        dispatcher: OutboxDispatcher,
        metrics: MetricsCollector,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            config,
        }
    }

    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for run in self.store.list_runs(Some(RunStatus::Running))? {
            report.runs_checked += 1;
            let repair = match self.reconcile_run(&run) {
                Ok(repair) => repair,
                Err(e) => {
                    tracing::warn!("Failed to reconcile run {}: {}", run.id, e);
                    continue;
                }
            };
            report.steps_created += repair.created;
            report.runs_completed += usize::from(repair.completed);

            match self.dispatcher.redeliver(&repair.pending).await {
                Ok(accepted) => report.jobs_redelivered += accepted,
                Err(e) => tracing::warn!("Failed to redeliver jobs for run {}: {}", run.id, e),
            }
        }

        report.outbox_delivered = self.dispatcher.drain().await?;

        if report.steps_created > 0 || report.runs_completed > 0 || report.jobs_redelivered > 0 {
            tracing::info!(
                runs_checked = report.runs_checked,
                steps_created = report.steps_created,
                runs_completed = report.runs_completed,
                jobs_redelivered = report.jobs_redelivered,
                "Reconciled running runs"
            );
        }
        Ok(report)
    }

    fn reconcile_run(&self, run: &AgentRun) -> EngineResult<RunRepair> {
        let version = match self.store.get_version(run.version_id)? {
            Some(version) => version,
            None => {
                tracing::warn!("Run {} references missing version {}", run.id, run.version_id);
                return Ok(RunRepair {
                    created: 0,
                    completed: false,
                    pending: Vec::new(),
                });
            }
        };

        let steps = self.store.list_steps(run.id)?;

        // Steps created below get their job through the outbox
        let pending = steps
            .iter()
            .filter(|step| step.status.is_pending())
            .filter_map(|step| {
                let node = version.dag.node(&step.node_id)?;
                let job = StepJob::for_step(run, node, step);
                Some(OutboxEntry::new(job, step.attempt))
            })
            .collect();

        let created = schedule_ready_steps(
            self.store.as_ref(),
            run,
            &version.dag,
            &steps,
            self.config.effective_max_attempts(),
        )?;
        let completed = try_complete_run(self.store.as_ref(), &self.metrics, run, &version.dag)?;
        Ok(RunRepair {
            created: created.len(),
            completed,
            pending,
        })
    }

    /// Reconcile on every tick until cancelled
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!("Reconcile pass failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Reconciler stopped");
    }
}
