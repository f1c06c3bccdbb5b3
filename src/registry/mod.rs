//! # Worker Registry
//!
//! Service discovery for executor instances behind the [`WorkerRegistry`]
//! trait. Workers self-register on startup, refresh with heartbeats, and
//! disappear on explicit deregistration or heartbeat expiry. The registry
//! is an explicit component injected into the dispatcher, never ambient
//! process state, so tests substitute a fake and deployments can swap
//! discovery backends.
//!
//! Lookup results are ordered deterministically (ascending assigned load,
//! ties broken by worker id) to make selection reproducible. Registry
//! unavailability or an empty result is not a task error: the task stays
//! PENDING and its notification is re-enqueued with delay.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Worker, WorkerRegistration};

pub use memory::InMemoryWorkerRegistry;

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Register a worker instance; returns the worker id (generated when
    /// the registration did not carry one). Re-registering an id replaces
    /// the previous record.
    async fn register(&self, registration: WorkerRegistration) -> Result<String>;

    /// Refresh a worker's heartbeat. WorkerNotFound for unknown ids.
    async fn heartbeat(&self, worker_id: &str) -> Result<()>;

    /// Remove a worker record. WorkerNotFound for unknown ids.
    async fn deregister(&self, worker_id: &str) -> Result<()>;

    /// Healthy, heartbeat-fresh workers advertising `capability`, ordered
    /// by ascending load then worker id.
    async fn lookup(&self, capability: &str) -> Result<Vec<Worker>>;

    /// Load accounting: a task was assigned to this worker.
    async fn note_dispatch(&self, worker_id: &str) -> Result<()>;

    /// Load accounting: an assignment ended (completion, failure, reclaim).
    async fn note_completion(&self, worker_id: &str) -> Result<()>;
}
