//! # Timeout Monitor
//!
//! Periodic sweep reclaiming tasks stuck in PROCESSING past the configured
//! maximum wait. This catches workers that died silently without ever
//! calling back, which heartbeats alone cannot: the worker's registry
//! entry may expire, but only the sweep returns its orphaned tasks to
//! PENDING (budget remaining) or drives them to TIMEOUT (budget spent).
//!
//! The monitor runs concurrently with any number of dispatchers and the
//! completion processor; the attempt-token check on its transitions
//! resolves the race between a genuine late completion and a
//! timeout-driven reclaim without timing assumptions.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::messaging::{DispatchMessage, TaskQueue};
use crate::models::{Task, TaskErrorDetail, TaskErrorKind};
use crate::orchestration::backoff::BackoffCalculator;
use crate::registry::WorkerRegistry;
use crate::resilience::RetryPolicy;
use crate::state_machine::TaskTransition;
use crate::store::TaskStore;

/// Counts from one sweep, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub reclaimed: usize,
    pub timed_out: usize,
    pub lost_races: usize,
    pub evicted: u64,
}

pub struct TimeoutMonitor {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<dyn WorkerRegistry>,
    backoff: BackoffCalculator,
    retry: RetryPolicy,
    config: MonitorConfig,
}

impl TimeoutMonitor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<dyn WorkerRegistry>,
        backoff: BackoffCalculator,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            backoff,
            retry: RetryPolicy::default(),
            config,
        }
    }

    /// Sweep on the configured interval until shutdown flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_seconds = self.config.monitor_interval_seconds,
            task_timeout_seconds = self.config.task_timeout_seconds,
            "🚀 timeout monitor started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.sweep_once().await {
                Ok(stats) if stats.examined > 0 || stats.evicted > 0 => {
                    info!(
                        examined = stats.examined,
                        reclaimed = stats.reclaimed,
                        timed_out = stats.timed_out,
                        evicted = stats.evicted,
                        "monitor sweep finished"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "monitor sweep failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.monitor_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("timeout monitor stopped");
    }

    /// One pass over stuck PROCESSING tasks, plus ttl eviction.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let now = Utc::now();
        let cutoff = now - self.config.task_timeout();
        let stuck = self.store.processing_older_than(cutoff).await?;

        let mut stats = SweepStats {
            examined: stuck.len(),
            ..SweepStats::default()
        };
        for task in stuck {
            match self.reclaim_or_time_out(task).await {
                Ok(Reclamation::Reclaimed) => stats.reclaimed += 1,
                Ok(Reclamation::TimedOut) => stats.timed_out += 1,
                Ok(Reclamation::LostRace) => stats.lost_races += 1,
                Err(err) => warn!(error = %err, "reclaim failed, will retry next sweep"),
            }
        }
        stats.evicted = self.store.delete_expired().await?;
        Ok(stats)
    }

    async fn reclaim_or_time_out(&self, task: Task) -> Result<Reclamation> {
        // Invariant: PROCESSING tasks carry a token. A record without one
        // is unreachable through the store transitions; skip defensively.
        let Some(token) = task.attempt_token else {
            return Ok(Reclamation::LostRace);
        };
        let elapsed_seconds = (Utc::now() - task.updated_at).num_seconds();
        let worker_id = task.assigned_worker.clone().unwrap_or_default();

        let outcome = if !task.attempts_exhausted() {
            // Budget remains: back to PENDING and schedule the next
            // attempt. The conditional transition loses (harmlessly) to
            // any completion that landed since the scan.
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
                    info!(
                        task_id = %task.task_id,
                        worker_id = %worker_id,
                        elapsed_seconds,
                        next_attempt,
                        "⏰ stuck task reclaimed for retry"
                    );
                    Reclamation::Reclaimed
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    debug!(task_id = %task.task_id, "reclaim lost to a concurrent transition");
                    return Ok(Reclamation::LostRace);
                }
                Err(err) => return Err(err),
            }
        } else {
            let error = TaskErrorDetail::new(
                TaskErrorKind::Timeout,
                format!(
                    "no completion within {}s (waited {elapsed_seconds}s); last worker: {worker_id}",
                    self.config.task_timeout_seconds
                ),
            )
            .with_detail(serde_json::json!({
                "elapsed_seconds": elapsed_seconds,
                "assigned_workers": task.assigned_worker_history(),
                "attempts": task.attempt_count,
            }));
            match self
                .store
                .transition(task.task_id, TaskTransition::time_out(token, error))
                .await
            {
                Ok(_) => {
                    warn!(
                        task_id = %task.task_id,
                        worker_id = %worker_id,
                        elapsed_seconds,
                        attempts = task.attempt_count,
                        "⏰ attempt budget exhausted, task timed out"
                    );
                    Reclamation::TimedOut
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    return Ok(Reclamation::LostRace)
                }
                Err(err) => return Err(err),
            }
        };

        if !worker_id.is_empty() {
            if let Err(err) = self.registry.note_completion(&worker_id).await {
                debug!(worker_id = %worker_id, error = %err, "load accounting skipped");
            }
        }
        Ok(outcome)
    }
}

enum Reclamation {
    Reclaimed,
    TimedOut,
    LostRace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::messaging::InMemoryTaskQueue;
    use crate::models::NewTask;
    use crate::registry::InMemoryWorkerRegistry;
    use crate::state_machine::TaskStatus;
    use crate::store::InMemoryTaskStore;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        queue: Arc<InMemoryTaskQueue>,
        monitor: TimeoutMonitor,
    }

    fn harness(task_timeout_seconds: u64) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let registry = Arc::new(InMemoryWorkerRegistry::new(chrono::Duration::seconds(30)));
        let backoff = BackoffCalculator::new(BackoffConfig {
            retry_delay_seconds: 0,
            max_delay_seconds: 1,
            multiplier: 1.0,
            jitter_enabled: false,
            max_jitter: 0.0,
        });
        let monitor = TimeoutMonitor::new(
            store.clone(),
            queue.clone(),
            registry,
            backoff,
            MonitorConfig {
                task_timeout_seconds,
                monitor_interval_seconds: 1,
            },
        );
        Harness {
            store,
            queue,
            monitor,
        }
    }

    async fn stuck_task(h: &Harness, max_attempts: i32, attempt: i32) -> Task {
        let task = Task::from_request(
            NewTask {
                task_type: "text:generation".to_string(),
                spec: json!({}),
                payload_ref: json!({}),
                max_attempts: Some(max_attempts),
                ttl_seconds: None,
            },
            3,
            chrono::Duration::seconds(3600),
        );
        h.store.create(task.clone()).await.unwrap();
        let mut current = task;
        for n in 1..=attempt {
            current = h
                .store
                .transition(
                    current.task_id,
                    TaskTransition::dispatch(format!("worker-{n}"), n, i64::from(n)),
                )
                .await
                .unwrap();
            if n < attempt {
                current = h
                    .store
                    .transition(current.task_id, TaskTransition::reclaim(i64::from(n)))
                    .await
                    .unwrap();
            }
        }
        current
    }

    #[tokio::test]
    async fn fresh_processing_tasks_are_left_alone() {
        let h = harness(120);
        stuck_task(&h, 2, 1).await;

        let stats = h.monitor.sweep_once().await.unwrap();
        assert_eq!(stats.examined, 0);
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test]
    async fn stale_processing_task_is_reclaimed() {
        // Zero timeout: every PROCESSING task is immediately stale.
        let h = harness(0);
        let task = stuck_task(&h, 2, 1).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let stats = h.monitor.sweep_once().await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.timed_out, 0);

        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.attempt_token.is_none());
        // Next attempt scheduled.
        assert_eq!(h.queue.depth(), 1);
    }

    #[tokio::test]
    async fn exhausted_task_times_out_with_worker_history() {
        let h = harness(0);
        let task = stuck_task(&h, 2, 2).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let stats = h.monitor.sweep_once().await.unwrap();
        assert_eq!(stats.timed_out, 1);

        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Timeout);
        let error = stored.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::Timeout);
        assert_eq!(
            error.detail["assigned_workers"],
            json!(["worker-1", "worker-2"])
        );
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_records() {
        let h = harness(120);
        let task = Task::from_request(
            NewTask {
                task_type: "text:generation".to_string(),
                spec: json!({}),
                payload_ref: json!({}),
                max_attempts: Some(1),
                ttl_seconds: Some(1),
            },
            3,
            chrono::Duration::seconds(3600),
        );
        let mut expired = task;
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        h.store.create(expired).await.unwrap();

        let stats = h.monitor.sweep_once().await.unwrap();
        assert_eq!(stats.evicted, 1);
    }
}
