use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricsCollector, STEPS_ENQUEUED};
use crate::queue::JobQueue;
use crate::storage::RunStore;
use crate::types::OutboxEntry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Moves outbox rows onto the job queue
#[derive(Clone)]
pub struct OutboxDispatcher {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    metrics: MetricsCollector,
    batch_size: usize,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
        metrics: MetricsCollector,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
            batch_size: batch_size.max(1),
        }
    }

    /// Enqueue `entries` in order, deleting each outbox row once the queue
    /// accepted it. Stops at the first enqueue failure; the rest stay in the
    /// outbox for the next drain.
    pub async fn dispatch(&self, entries: &[OutboxEntry]) -> EngineResult<usize> {
        let mut delivered = 0;
        for entry in entries {
            self.offer(entry).await?;
            self.store.remove_outbox(&entry.job_id)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Offer jobs for steps that already exist, without touching the
    /// outbox. Returns how many the queue accepted; ids still queued or in
    /// flight are absorbed by its de-duplication.
    pub async fn redeliver(&self, entries: &[OutboxEntry]) -> EngineResult<usize> {
        let mut accepted = 0;
        for entry in entries {
            if self.offer(entry).await? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    async fn offer(&self, entry: &OutboxEntry) -> EngineResult<bool> {
        let accepted = self
            .queue
            .enqueue(&entry.job_id, entry.job.clone())
            .await
            .map_err(|e| EngineError::EnqueueFailure {
                job_id: entry.job_id.clone(),
                message: e.to_string(),
            })?;

        if accepted {
            self.metrics
                .increment_counter(STEPS_ENQUEUED, &[("connector", entry.job.connector.as_str())]);
        }
        Ok(accepted)
    }

    /// Like `dispatch`, but an enqueue failure is only logged
    pub async fn dispatch_or_defer(&self, entries: &[OutboxEntry]) -> usize {
        match self.dispatch(entries).await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!("Deferred enqueue to outbox drain: {}", e);
                0
            }
        }
    }

    /// Re-deliver everything still pending in the outbox
    pub async fn drain(&self) -> EngineResult<usize> {
        let mut total = 0;
        loop {
            let pending = self.store.pending_outbox(self.batch_size)?;
            if pending.is_empty() {
                break;
            }
            let delivered = self.dispatch(&pending).await?;
            total += delivered;
            if pending.len() < self.batch_size {
                break;
            }
        }

        if total > 0 {
            tracing::info!("Drained {} outbox entries", total);
        }
        Ok(total)
    }

    /// Drain on every tick until cancelled
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        tracing::warn!("Outbox drain failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Outbox dispatcher stopped");
    }
}
