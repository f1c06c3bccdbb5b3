//! # Dispatcher
//!
//! The scheduling loop: consumes dispatch notifications, selects the
//! least-loaded capable worker, performs the atomic PENDING→PROCESSING
//! transition, and issues the execution call.
//!
//! Any number of dispatcher instances may consume the same queue.
//! Correctness never depends on queue exclusivity (at-least-once delivery
//! guarantees duplicates), only on the store's conditional transition:
//! exactly one consumer wins the PENDING→PROCESSING edge, everyone else
//! observes a Conflict and discards. A notification is acknowledged only
//! once its task has been handled or definitively claimed by someone else;
//! crashing mid-flight just means redelivery.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{DispatchPolicyConfig, QueueConfig};
use crate::error::{DispatchError, Result};
use crate::messaging::{DispatchMessage, QueuedMessage, TaskQueue};
use crate::models::{Task, TaskErrorDetail, TaskErrorKind, Worker};
use crate::orchestration::backoff::BackoffCalculator;
use crate::registry::WorkerRegistry;
use crate::resilience::RetryPolicy;
use crate::state_machine::TaskTransition;
use crate::store::TaskStore;
use crate::worker::{ExecutionRequest, SubmitResponse, WorkerClient};

/// What became of one dequeued notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Claimed, execution call accepted by the worker.
    Dispatched { worker_id: String },
    /// The task is no longer PENDING (completed, cancelled, expired):
    /// stale notification, discarded.
    Stale,
    /// Another consumer won the PENDING→PROCESSING race.
    LostRace,
    /// No capable worker under the load cap; task left PENDING and the
    /// notification re-enqueued with delay.
    NoWorkerAvailable,
    /// The execution call failed immediately; budget remains, so the task
    /// went back to PENDING and the next attempt is scheduled.
    RetryScheduled { next_attempt: i32 },
    /// The execution call failed immediately and the budget is spent.
    Exhausted,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<dyn WorkerRegistry>,
    worker_client: Arc<dyn WorkerClient>,
    backoff: BackoffCalculator,
    retry: RetryPolicy,
    queue_config: QueueConfig,
    policy: DispatchPolicyConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<dyn WorkerRegistry>,
        worker_client: Arc<dyn WorkerClient>,
        backoff: BackoffCalculator,
        queue_config: QueueConfig,
        policy: DispatchPolicyConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            worker_client,
            backoff,
            retry: RetryPolicy::default(),
            queue_config,
            policy,
        }
    }

    /// Consume notifications until shutdown flips to true. In-flight
    /// processing always finishes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(instance_id = %self.policy.instance_id, "🚀 dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.poll_once().await {
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "dispatch poll failed, backing off");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.queue_config.poll_interval()) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(instance_id = %self.policy.instance_id, "dispatcher stopped");
    }

    /// Read one batch and process every delivered notification. Returns
    /// how many were delivered.
    pub async fn poll_once(&self) -> Result<usize> {
        let delivered = self
            .queue
            .read(
                self.queue_config.visibility_timeout(),
                self.queue_config.batch_size as usize,
            )
            .await?;
        let count = delivered.len();
        for queued in delivered {
            let task_id = queued.message.task_id;
            match self.process(&queued).await {
                Ok(outcome) => {
                    debug!(task_id = %task_id, outcome = ?outcome, "notification processed")
                }
                Err(err) => {
                    // Leave unacknowledged: visibility timeout will
                    // redeliver and the store's atomicity makes the
                    // redelivery idempotent.
                    warn!(task_id = %task_id, error = %err, "notification processing failed, will redeliver");
                }
            }
        }
        Ok(count)
    }

    /// Handle a single dequeued notification per the state machine core.
    pub async fn process(&self, queued: &QueuedMessage) -> Result<DispatchOutcome> {
        let message = &queued.message;

        // Re-fetch: the notification may be stale by the time it arrives.
        let task = match self.store.get(message.task_id).await {
            Ok(task) => task,
            Err(err) if err.is_not_found() => {
                self.ack(queued.receipt).await?;
                return Ok(DispatchOutcome::Stale);
            }
            Err(err) => return Err(err),
        };
        if !task.status.is_dispatchable() {
            // Covers terminal states and CANCELLED: abort silently.
            debug!(task_id = %task.task_id, status = %task.status, "stale notification discarded");
            self.ack(queued.receipt).await?;
            return Ok(DispatchOutcome::Stale);
        }

        let Some(worker) = self.select_worker(&task).await else {
            // Not an error condition for the task: it stays PENDING and
            // the notification comes back after the retry delay.
            let delay = self.backoff.delay_for_attempt(message.attempt);
            info!(
                task_id = %task.task_id,
                task_type = %task.task_type,
                delay_seconds = delay.as_secs(),
                "⏳ no available worker, re-enqueueing"
            );
            self.requeue(message.clone(), delay).await?;
            self.ack(queued.receipt).await?;
            return Ok(DispatchOutcome::NoWorkerAvailable);
        };

        // The sole source of mutual exclusion: atomic check-and-set.
        let attempt = task.attempt_count + 1;
        let token = i64::from(attempt);
        let claimed = match self
            .store
            .transition(
                task.task_id,
                TaskTransition::dispatch(&worker.worker_id, attempt, token),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) if err.is_conflict() => {
                self.ack(queued.receipt).await?;
                return Ok(DispatchOutcome::LostRace);
            }
            Err(err) if err.is_not_found() => {
                self.ack(queued.receipt).await?;
                return Ok(DispatchOutcome::Stale);
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = self.registry.note_dispatch(&worker.worker_id).await {
            debug!(worker_id = %worker.worker_id, error = %err, "load accounting skipped");
        }
        info!(
            task_id = %claimed.task_id,
            task_type = %claimed.task_type,
            worker_id = %worker.worker_id,
            attempt,
            "🚚 task dispatched"
        );

        // Fire-and-forget relative to this loop: only the ack/reject
        // handshake is awaited, completion arrives asynchronously.
        let request = ExecutionRequest::from_task(&claimed, token);
        match self.worker_client.submit(&worker, &request).await {
            Ok(SubmitResponse::Accepted) => {
                self.ack(queued.receipt).await?;
                Ok(DispatchOutcome::Dispatched {
                    worker_id: worker.worker_id,
                })
            }
            Ok(SubmitResponse::Rejected { reason }) => {
                let err = DispatchError::worker_execution(
                    &worker.worker_id,
                    format!("submit rejected: {reason}"),
                );
                self.handle_submit_failure(&claimed, &worker, token, err, queued.receipt)
                    .await
            }
            Err(err) => {
                self.handle_submit_failure(&claimed, &worker, token, err, queued.receipt)
                    .await
            }
        }
    }

    /// Least-loaded capable healthy worker under the per-worker cap.
    /// Registry unavailability degrades to "none available".
    async fn select_worker(&self, task: &Task) -> Option<Worker> {
        let candidates = match self.registry.lookup(&task.task_type).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(
                    task_id = %task.task_id,
                    error = %err,
                    "registry lookup failed, leaving task pending"
                );
                return None;
            }
        };
        candidates
            .into_iter()
            .find(|worker| worker.load < self.policy.max_pending_per_worker)
    }

    /// The execution call itself failed immediately. The attempt budget
    /// was already charged at dispatch time: retry if any remains,
    /// otherwise the task is FAILED with the call error recorded.
    async fn handle_submit_failure(
        &self,
        claimed: &Task,
        worker: &Worker,
        token: i64,
        err: DispatchError,
        receipt: i64,
    ) -> Result<DispatchOutcome> {
        warn!(
            task_id = %claimed.task_id,
            worker_id = %worker.worker_id,
            attempt = claimed.attempt_count,
            error = %err,
            "execution call failed immediately"
        );
        if let Err(note_err) = self.registry.note_completion(&worker.worker_id).await {
            debug!(worker_id = %worker.worker_id, error = %note_err, "load accounting skipped");
        }

        if claimed.attempt_count < claimed.max_attempts {
            match self
                .store
                .transition(claimed.task_id, TaskTransition::reclaim(token))
                .await
            {
                Ok(reclaimed) => {
                    let next_attempt = reclaimed.attempt_count + 1;
                    let delay = self.backoff.delay_for_attempt(reclaimed.attempt_count);
                    self.requeue(
                        DispatchMessage::for_attempt(&reclaimed, next_attempt),
                        delay,
                    )
                    .await?;
                    self.ack(receipt).await?;
                    Ok(DispatchOutcome::RetryScheduled { next_attempt })
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    self.ack(receipt).await?;
                    Ok(DispatchOutcome::Stale)
                }
                Err(err) => Err(err),
            }
        } else {
            let detail = TaskErrorDetail::new(
                TaskErrorKind::Dispatch,
                format!("execution call to {} failed: {err}", worker.worker_id),
            )
            .with_detail(serde_json::json!({
                "worker_id": worker.worker_id,
                "attempt": claimed.attempt_count,
            }));
            match self
                .store
                .transition(claimed.task_id, TaskTransition::fail(token, detail))
                .await
            {
                Ok(_) => {
                    warn!(
                        task_id = %claimed.task_id,
                        attempts = claimed.attempt_count,
                        "❌ attempt budget exhausted, task failed"
                    );
                    self.ack(receipt).await?;
                    Ok(DispatchOutcome::Exhausted)
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    self.ack(receipt).await?;
                    Ok(DispatchOutcome::Stale)
                }
                Err(err) => Err(err),
            }
        }
    }

    async fn requeue(&self, message: DispatchMessage, delay: Duration) -> Result<()> {
        self.retry
            .run("task_queue", || self.queue.send_delayed(&message, delay))
            .await?;
        Ok(())
    }

    async fn ack(&self, receipt: i64) -> Result<()> {
        self.retry.run("task_queue", || self.queue.ack(receipt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::messaging::InMemoryTaskQueue;
    use crate::models::{NewTask, WorkerRegistration};
    use crate::registry::InMemoryWorkerRegistry;
    use crate::state_machine::TaskStatus;
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Scripted worker client: answers from a queue of canned responses,
    /// recording every submission.
    struct ScriptedWorkerClient {
        responses: Mutex<Vec<Result<SubmitResponse>>>,
        submissions: Mutex<Vec<ExecutionRequest>>,
    }

    impl ScriptedWorkerClient {
        fn always_accept() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                submissions: Mutex::new(Vec::new()),
            }
        }

        fn scripted(responses: Vec<Result<SubmitResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                submissions: Mutex::new(Vec::new()),
            }
        }

        fn submission_count(&self) -> usize {
            self.submissions.lock().len()
        }
    }

    #[async_trait]
    impl WorkerClient for ScriptedWorkerClient {
        async fn submit(
            &self,
            _worker: &Worker,
            request: &ExecutionRequest,
        ) -> Result<SubmitResponse> {
            self.submissions.lock().push(request.clone());
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(SubmitResponse::Accepted)
            } else {
                responses.remove(0)
            }
        }
    }

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        queue: Arc<InMemoryTaskQueue>,
        registry: Arc<InMemoryWorkerRegistry>,
        client: Arc<ScriptedWorkerClient>,
        dispatcher: Dispatcher,
    }

    fn harness(client: ScriptedWorkerClient) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let registry = Arc::new(InMemoryWorkerRegistry::new(chrono::Duration::seconds(30)));
        let client = Arc::new(client);
        let backoff = BackoffCalculator::new(BackoffConfig {
            retry_delay_seconds: 0,
            max_delay_seconds: 1,
            multiplier: 1.0,
            jitter_enabled: false,
            max_jitter: 0.0,
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            client.clone(),
            backoff,
            QueueConfig::default(),
            DispatchPolicyConfig::default(),
        );
        Harness {
            store,
            queue,
            registry,
            client,
            dispatcher,
        }
    }

    async fn seed_task(harness: &Harness, max_attempts: i32) -> Task {
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
        harness.store.create(task.clone()).await.unwrap();
        harness
            .queue
            .send(&DispatchMessage::initial(&task))
            .await
            .unwrap();
        task
    }

    async fn register_worker(harness: &Harness, id: &str) {
        harness
            .registry
            .register(WorkerRegistration {
                worker_id: Some(id.to_string()),
                address: "http://127.0.0.1:8001".to_string(),
                capabilities: vec!["text:generation".to_string()],
            })
            .await
            .unwrap();
    }

    async fn read_one(harness: &Harness) -> QueuedMessage {
        let mut delivered = harness
            .queue
            .read(std::time::Duration::from_secs(30), 1)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        delivered.remove(0)
    }

    #[tokio::test]
    async fn dispatches_to_registered_worker() {
        let h = harness(ScriptedWorkerClient::always_accept());
        let task = seed_task(&h, 3).await;
        register_worker(&h, "worker-a").await;

        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                worker_id: "worker-a".to_string()
            }
        );

        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.attempt_token, Some(1));
        assert_eq!(stored.assigned_worker.as_deref(), Some("worker-a"));
        assert_eq!(h.client.submission_count(), 1);
        assert_eq!(h.queue.depth(), 0);

        // Load accounting moved with the assignment.
        let workers = h.registry.lookup("text:generation").await.unwrap();
        assert_eq!(workers[0].load, 1);
    }

    #[tokio::test]
    async fn no_worker_leaves_task_pending_and_requeues() {
        let h = harness(ScriptedWorkerClient::always_accept());
        let task = seed_task(&h, 3).await;

        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoWorkerAvailable);

        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
        // Original acked, replacement scheduled.
        assert_eq!(h.queue.depth(), 1);
        assert_eq!(h.client.submission_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_notifications_have_one_winner() {
        let h = harness(ScriptedWorkerClient::always_accept());
        let task = seed_task(&h, 3).await;
        // At-least-once: the same notification delivered twice.
        h.queue
            .send(&DispatchMessage::initial(&task))
            .await
            .unwrap();
        register_worker(&h, "worker-a").await;
        register_worker(&h, "worker-b").await;

        let first = read_one(&h).await;
        let second = read_one(&h).await;
        let (a, b) = tokio::join!(h.dispatcher.process(&first), h.dispatcher.process(&second));
        let outcomes = [a.unwrap(), b.unwrap()];

        let dispatched = outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Dispatched { .. }))
            .count();
        assert_eq!(dispatched, 1);
        assert_eq!(h.client.submission_count(), 1);

        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn submit_failure_reschedules_until_budget_exhausted() {
        let h = harness(ScriptedWorkerClient::scripted(vec![
            Err(DispatchError::worker_execution("worker-a", "connection refused")),
            Err(DispatchError::worker_execution("worker-a", "connection refused")),
        ]));
        let task = seed_task(&h, 2).await;
        register_worker(&h, "worker-a").await;

        // Attempt 1: fails, budget remains.
        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::RetryScheduled { next_attempt: 2 });
        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempt_count, 1);

        // Attempt 2: fails, budget spent.
        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Exhausted);
        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempt_count, 2);
        let error = stored.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::Dispatch);
        assert_eq!(h.queue.depth(), 0);

        // Load accounting released on both failures.
        let workers = h.registry.lookup("text:generation").await.unwrap();
        assert_eq!(workers[0].load, 0);
    }

    #[tokio::test]
    async fn worker_rejection_counts_as_call_failure() {
        let h = harness(ScriptedWorkerClient::scripted(vec![Ok(
            SubmitResponse::Rejected {
                reason: "at capacity".to_string(),
            },
        )]));
        let task = seed_task(&h, 3).await;
        register_worker(&h, "worker-a").await;

        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::RetryScheduled { next_attempt: 2 });
        let stored = h.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn cancelled_task_discarded_silently() {
        let h = harness(ScriptedWorkerClient::always_accept());
        let task = seed_task(&h, 3).await;
        register_worker(&h, "worker-a").await;
        h.store
            .transition(task.task_id, TaskTransition::cancel(TaskStatus::Pending))
            .await
            .unwrap();

        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Stale);
        assert_eq!(h.client.submission_count(), 0);
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test]
    async fn overloaded_workers_are_skipped() {
        let h = harness(ScriptedWorkerClient::always_accept());
        seed_task(&h, 3).await;
        register_worker(&h, "worker-a").await;
        // Saturate worker-a to the cap (default max_pending_per_worker = 2).
        h.registry.note_dispatch("worker-a").await.unwrap();
        h.registry.note_dispatch("worker-a").await.unwrap();

        let queued = read_one(&h).await;
        let outcome = h.dispatcher.process(&queued).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoWorkerAvailable);
    }
}
