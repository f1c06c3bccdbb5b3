//! # Task Queue
//!
//! Durable at-least-once delivery of dispatch notifications behind the
//! [`TaskQueue`] trait.
//!
//! Delivery semantics are visibility-timeout based: a read message stays
//! invisible until acknowledged or until the timeout elapses, at which
//! point it is redelivered. Consumers acknowledge only after the
//! corresponding store transition succeeds or definitively fails with
//! Conflict, so a crash between read and transition causes safe redelivery
//! that the store's atomicity renders idempotent. Retries are scheduled as
//! delayed sends, never as inline sleeps.

pub mod memory;
pub mod pgmq;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::Task;

pub use memory::InMemoryTaskQueue;
pub use self::pgmq::PgmqTaskQueue;

/// Dispatch notification carried by the queue, keyed by task id and
/// attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub task_id: Uuid,
    pub task_type: String,
    pub attempt: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchMessage {
    /// Notification for the given attempt of a task.
    pub fn for_attempt(task: &Task, attempt: i32) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type.clone(),
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    /// Initial notification enqueued at creation time.
    pub fn initial(task: &Task) -> Self {
        Self::for_attempt(task, 1)
    }
}

/// A delivered message plus the receipt needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub receipt: i64,
    /// Times this message has been delivered, including this delivery.
    pub delivery_count: i32,
    pub message: DispatchMessage,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue for immediate delivery. Returns the message id.
    async fn send(&self, message: &DispatchMessage) -> Result<i64>;

    /// Enqueue invisible for `delay`; the scheduled re-enqueue primitive
    /// behind every retry path.
    async fn send_delayed(&self, message: &DispatchMessage, delay: Duration) -> Result<i64>;

    /// Read up to `limit` visible messages, making each invisible for
    /// `visibility_timeout`.
    async fn read(&self, visibility_timeout: Duration, limit: usize) -> Result<Vec<QueuedMessage>>;

    /// Acknowledge (remove) a delivered message.
    async fn ack(&self, receipt: i64) -> Result<()>;

    /// Move a poison message aside instead of deleting it outright.
    async fn archive(&self, receipt: i64) -> Result<()>;
}
