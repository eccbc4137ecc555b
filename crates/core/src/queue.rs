// Step job queue and dead-letter queue

use crate::error::{EngineError, EngineResult};
use crate::types::StepJob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A job handed to a worker
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub job: StepJob,
}

/// A job parked after its step exhausted its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: StepJob,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Failure record kept for a job the worker could not process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub job_id: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

/// Work queue consumed by the step workers
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns `false` if a job with this id is queued or in flight.
    async fn enqueue(&self, job_id: &str, job: StepJob) -> EngineResult<bool>;

    /// Wait for the next job; `None` once the queue is closed.
    async fn dequeue(&self) -> Option<QueuedJob>;

    async fn ack(&self, job_id: &str) -> EngineResult<()>;

    async fn fail(&self, job_id: &str, error: &str) -> EngineResult<()>;

    async fn dead_letter(&self, job: StepJob, error: &str) -> EngineResult<()>;
}

/// Failure records kept for inspection; older ones are dropped
pub const MAX_FAILURE_RECORDS: usize = 1_000;

#[derive(Default)]
struct QueueState {
    /// Ids queued or in flight. Settled ids are forgotten, so a later
    /// redelivery of the same id is accepted and left to the worker's
    /// step-state checks.
    seen: HashSet<String>,
    in_flight: HashSet<String>,
    failures: VecDeque<FailedJob>,
    dead_letters: Vec<DeadLetter>,
    stats: QueueStats,
}

/// In-process queue backed by an unbounded tokio channel
pub struct MemoryJobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            state: Mutex::new(QueueState::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject every enqueue while set, as a disconnected broker would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Next job if one is waiting, without blocking
    pub async fn try_dequeue(&self) -> Option<QueuedJob> {
        let job = self.receiver.lock().await.try_recv().ok()?;
        self.state().in_flight.insert(job.job_id.clone());
        Some(job)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    pub fn failures(&self) -> Vec<FailedJob> {
        self.state().failures.iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        self.state().stats.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job_id: &str, job: StepJob) -> EngineResult<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Queue("queue unavailable".to_string()));
        }

        {
            let mut state = self.state();
            if !state.seen.insert(job_id.to_string()) {
                tracing::debug!(job_id, "Job already accepted, skipping");
                return Ok(false);
            }
            state.stats.accepted += 1;
        }

        self.sender
            .send(QueuedJob {
                job_id: job_id.to_string(),
                job,
            })
            .map_err(|_| EngineError::Queue("queue closed".to_string()))?;
        Ok(true)
    }

    async fn dequeue(&self) -> Option<QueuedJob> {
        let job = self.receiver.lock().await.recv().await?;
        self.state().in_flight.insert(job.job_id.clone());
        Some(job)
    }

    async fn ack(&self, job_id: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.in_flight.remove(job_id);
        state.seen.remove(job_id);
        state.stats.completed += 1;
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.in_flight.remove(job_id);
        state.seen.remove(job_id);
        state.stats.failed += 1;
        if state.failures.len() >= MAX_FAILURE_RECORDS {
            state.failures.pop_front();
        }
        state.failures.push_back(FailedJob {
            job_id: job_id.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letter(&self, job: StepJob, error: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.stats.dead_lettered += 1;
        state.dead_letters.push(DeadLetter {
            job,
            error: error.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }
}
