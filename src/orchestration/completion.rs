//! # Completion Processor
//!
//! Receives worker results and errors and performs the terminal (or retry)
//! transition. The attempt token carried by the callback is validated by
//! the store's conditional transition: a mismatch means the task was
//! reclaimed and re-dispatched since that attempt, so the stale completion
//! is discarded and the newer attempt keeps governing the task.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::messaging::{DispatchMessage, TaskQueue};
use crate::models::{Task, TaskErrorDetail, TaskErrorKind};
use crate::orchestration::backoff::BackoffCalculator;
use crate::registry::WorkerRegistry;
use crate::resilience::RetryPolicy;
use crate::state_machine::{TaskStatus, TaskTransition};
use crate::store::TaskStore;
use crate::worker::{CompletionOutcome, CompletionReport};

/// What became of one completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionDisposition {
    /// Result recorded; the task is SUCCESS.
    Recorded,
    /// Worker reported failure; budget remains, next attempt scheduled.
    RetryScheduled { next_attempt: i32 },
    /// Worker reported failure and the budget is spent; the task is FAILED.
    Failed,
    /// The attempt token no longer matches (or the task is already
    /// terminal); the callback was discarded.
    StaleDiscarded,
    /// The task was cancelled; the callback was discarded silently.
    CancelledDiscarded,
}

pub struct CompletionProcessor {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<dyn WorkerRegistry>,
    backoff: BackoffCalculator,
    retry: RetryPolicy,
}

impl CompletionProcessor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<dyn WorkerRegistry>,
        backoff: BackoffCalculator,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            backoff,
            retry: RetryPolicy::default(),
        }
    }

    /// Apply a worker completion callback. NotFound surfaces to the caller
    /// (unknown or expired task id); everything else resolves internally.
    pub async fn complete(&self, report: CompletionReport) -> Result<CompletionDisposition> {
        let task = self.store.get(report.task_id).await?;

        if task.status == TaskStatus::Cancelled {
            debug!(task_id = %task.task_id, "completion for cancelled task discarded");
            return Ok(CompletionDisposition::CancelledDiscarded);
        }
        if task.status.is_terminal() || task.attempt_token != Some(report.attempt_token) {
            debug!(
                task_id = %task.task_id,
                reported_token = report.attempt_token,
                current_token = ?task.attempt_token,
                "stale completion discarded"
            );
            return Ok(CompletionDisposition::StaleDiscarded);
        }

        let worker_id = task.assigned_worker.clone();
        let disposition = match report.outcome {
            CompletionOutcome::Success { result } => {
                self.record_success(&task, report.attempt_token, result)
                    .await?
            }
            CompletionOutcome::Failure { message, detail } => {
                self.record_failure(&task, report.attempt_token, message, detail)
                    .await?
            }
        };

        // Release load accounting unless the callback turned out stale (a
        // stale callback's assignment was already released by whoever
        // reclaimed the attempt).
        if disposition != CompletionDisposition::StaleDiscarded {
            if let Some(worker_id) = worker_id {
                if let Err(err) = self.registry.note_completion(&worker_id).await {
                    debug!(worker_id = %worker_id, error = %err, "load accounting skipped");
                }
            }
        }
        Ok(disposition)
    }

    async fn record_success(
        &self,
        task: &Task,
        token: i64,
        result: serde_json::Value,
    ) -> Result<CompletionDisposition> {
        match self
            .store
            .transition(task.task_id, TaskTransition::succeed(token, result))
            .await
        {
            Ok(_) => {
                info!(
                    task_id = %task.task_id,
                    attempt = task.attempt_count,
                    "✅ task completed successfully"
                );
                Ok(CompletionDisposition::Recorded)
            }
            Err(err) if err.is_conflict() => Ok(CompletionDisposition::StaleDiscarded),
            Err(err) => Err(err),
        }
    }

    async fn record_failure(
        &self,
        task: &Task,
        token: i64,
        message: String,
        detail: serde_json::Value,
    ) -> Result<CompletionDisposition> {
        warn!(
            task_id = %task.task_id,
            attempt = task.attempt_count,
            error = %message,
            "worker reported failure"
        );

        if !task.attempts_exhausted() {
            // Budget was charged at dispatch; schedule the next attempt.
            match self
                .store
                .transition(task.task_id, TaskTransition::reclaim(token))
                .await
            {
                Ok(reclaimed) => {
                    let next_attempt = reclaimed.attempt_count + 1;
                    let delay = self.backoff.delay_for_attempt(reclaimed.attempt_count);
                    let notification = DispatchMessage::for_attempt(&reclaimed, next_attempt);
                    self.retry
                        .run("task_queue", || {
                            self.queue.send_delayed(&notification, delay)
                        })
                        .await?;
                    Ok(CompletionDisposition::RetryScheduled { next_attempt })
                }
                Err(err) if err.is_conflict() => Ok(CompletionDisposition::StaleDiscarded),
                Err(err) => Err(err),
            }
        } else {
            let error = TaskErrorDetail::new(TaskErrorKind::WorkerExecution, message)
                .with_detail(detail);
            match self
                .store
                .transition(task.task_id, TaskTransition::fail(token, error))
                .await
            {
                Ok(_) => Ok(CompletionDisposition::Failed),
                Err(err) if err.is_conflict() => Ok(CompletionDisposition::StaleDiscarded),
                Err(err) => Err(err),
            }
        }
    }
}
