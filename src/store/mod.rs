//! # Task Store
//!
//! Durable key-value state for task records behind the [`TaskStore`] trait.
//!
//! The single primitive that matters is [`TaskStore::transition`]: an atomic
//! conditional update that only applies when the stored status (and, for
//! completion-driven edges, the attempt token) matches the expectation in
//! the [`TaskTransition`]. Dispatch exactly-once-effectiveness and stale
//! completion rejection both reduce to this check; queue semantics are never
//! relied upon for mutual exclusion.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::Task;
use crate::state_machine::TaskTransition;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a freshly created record. Conflict if the id already exists.
    async fn create(&self, task: Task) -> Result<()>;

    /// Fetch a record. NotFound if absent or past its ttl.
    async fn get(&self, task_id: Uuid) -> Result<Task>;

    /// Atomically apply one state-machine edge and return the updated
    /// record. Conflict if the stored status or attempt token does not
    /// match the transition's expectation.
    async fn transition(&self, task_id: Uuid, transition: TaskTransition) -> Result<Task>;

    /// PROCESSING tasks whose last update is older than `cutoff`; the
    /// timeout monitor's sweep query.
    async fn processing_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Evict records past their ttl. Returns the number removed.
    async fn delete_expired(&self) -> Result<u64>;
}
