//! # Dispatch System
//!
//! Wiring facade: owns the store, queue, registry and worker client,
//! serves the gateway- and worker-facing operations, and runs the
//! dispatcher and timeout monitor loops until shutdown.
//!
//! The production constructor connects Postgres (task store) and pgmq
//! (task queue) over one shared pool, with the in-process registry and the
//! HTTP worker client. Every collaborator sits behind a trait, so tests
//! and embedders assemble the system from their own parts instead.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::messaging::{DispatchMessage, PgmqTaskQueue, TaskQueue};
use crate::models::{NewTask, Task, TaskView, WorkerRegistration};
use crate::orchestration::backoff::BackoffCalculator;
use crate::orchestration::completion::{CompletionDisposition, CompletionProcessor};
use crate::orchestration::dispatcher::Dispatcher;
use crate::orchestration::timeout_monitor::TimeoutMonitor;
use crate::registry::{InMemoryWorkerRegistry, WorkerRegistry};
use crate::resilience::RetryPolicy;
use crate::state_machine::{TaskStatus, TaskTransition};
use crate::store::{PostgresTaskStore, TaskStore};
use crate::worker::{CompletionReport, HttpWorkerClient, WorkerClient};

/// Narrow result view: SUCCESS carries the result, FAILED/TIMEOUT carry the
/// error, anything else is simply not ready yet.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub ready: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<crate::models::TaskErrorDetail>,
}

pub struct DispatchSystem {
    config: DispatchConfig,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<dyn WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<TimeoutMonitor>,
    completion: Arc<CompletionProcessor>,
    retry: RetryPolicy,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchSystem {
    /// Assemble from explicit collaborators.
    pub fn from_parts(
        config: DispatchConfig,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<dyn WorkerRegistry>,
        worker_client: Arc<dyn WorkerClient>,
    ) -> Self {
        let backoff = BackoffCalculator::new(config.backoff.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            worker_client,
            backoff.clone(),
            config.queue.clone(),
            config.dispatch.clone(),
        ));
        let monitor = Arc::new(TimeoutMonitor::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            backoff.clone(),
            config.monitor.clone(),
        ));
        let completion = Arc::new(CompletionProcessor::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            backoff,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            queue,
            registry,
            dispatcher,
            monitor,
            completion,
            retry: RetryPolicy::default(),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Production wiring: Postgres task store and pgmq queue on a shared
    /// pool, in-process registry, HTTP worker client.
    pub async fn connect(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        let store = PostgresTaskStore::connect(&config.database).await?;
        store.ensure_schema().await?;
        let queue =
            PgmqTaskQueue::new_with_pool(store.pool().clone(), &config.queue.queue_name).await?;
        let registry = Arc::new(InMemoryWorkerRegistry::new(config.registry.heartbeat_ttl()));
        let worker_client = Arc::new(HttpWorkerClient::new(
            config.worker_client.submit_timeout(),
        )?);
        info!(
            queue = %config.queue.queue_name,
            instance_id = %config.dispatch.instance_id,
            "✅ dispatch system connected"
        );
        Ok(Self::from_parts(
            config,
            Arc::new(store),
            Arc::new(queue),
            registry,
            worker_client,
        ))
    }

    /// Spawn the dispatcher and timeout monitor loops.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        let dispatcher = Arc::clone(&self.dispatcher);
        let rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move { dispatcher.run(rx).await }));

        let monitor = Arc::clone(&self.monitor);
        let rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move { monitor.run(rx).await }));
    }

    /// Signal shutdown and wait for the loops to finish their in-flight
    /// work.
    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            // No receivers: loops never started or already exited.
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "loop task did not shut down cleanly");
            }
        }
        info!("dispatch system stopped");
    }

    // ---- Gateway-facing operations ----

    /// Validate, persist PENDING, enqueue the initial dispatch
    /// notification. Returns the generated task id.
    pub async fn create_task(&self, request: NewTask) -> Result<Uuid> {
        request.validate()?;
        let task = Task::from_request(
            request,
            self.config.dispatch.task_max_retries,
            self.config.task.task_ttl(),
        );
        let task_id = task.task_id;
        self.store.create(task.clone()).await?;

        let notification = DispatchMessage::initial(&task);
        self.retry
            .run("task_queue", || self.queue.send(&notification))
            .await?;
        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            max_attempts = task.max_attempts,
            "📥 task created"
        );
        Ok(task_id)
    }

    /// Latest status view: status, result or error, attempt counts,
    /// timestamps.
    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskView> {
        Ok(TaskView::from(&self.store.get(task_id).await?))
    }

    pub async fn get_task_status(&self, task_id: Uuid) -> Result<TaskStatus> {
        Ok(self.store.get(task_id).await?.status)
    }

    /// Result view; `ready` is false while the task is still in flight.
    pub async fn get_task_result(&self, task_id: Uuid) -> Result<TaskOutcome> {
        let task = self.store.get(task_id).await?;
        Ok(TaskOutcome {
            task_id: task.task_id,
            status: task.status,
            ready: task.status.is_terminal(),
            result: task.result,
            error: task.error,
        })
    }

    /// Cancel any non-terminal task. Components recognize CANCELLED
    /// cooperatively and abort without errors; a task already terminal is
    /// a Conflict surfaced to the caller.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        // Two tries cover the task moving (e.g. PENDING→PROCESSING) under
        // our feet; a terminal state ends the loop either way.
        for _ in 0..2 {
            let task = self.store.get(task_id).await?;
            if task.status.is_terminal() {
                return Err(DispatchError::conflict(
                    task_id,
                    format!("task already terminal: {}", task.status),
                ));
            }
            match self
                .store
                .transition(task_id, TaskTransition::cancel(task.status))
                .await
            {
                Ok(_) => {
                    info!(task_id = %task_id, "🛑 task cancelled");
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DispatchError::conflict(
            task_id,
            "task kept moving during cancellation",
        ))
    }

    // ---- Worker-facing operations ----

    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<String> {
        self.registry.register(registration).await
    }

    pub async fn worker_heartbeat(&self, worker_id: &str) -> Result<()> {
        self.registry.heartbeat(worker_id).await
    }

    pub async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        self.registry.deregister(worker_id).await
    }

    /// Worker completion callback.
    pub async fn complete(&self, report: CompletionReport) -> Result<CompletionDisposition> {
        self.completion.complete(report).await
    }

    // ---- Component access (embedders and tests drive loops manually) ----

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &TimeoutMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}
