//! pgmq-backed task queue.
//!
//! Uses the pgmq extension's visibility-timeout delivery: `read` makes a
//! message invisible for the timeout, `delete` acknowledges it, `archive`
//! moves poison messages to the archive table. Delayed sends back the
//! scheduled re-enqueue primitive.

use async_trait::async_trait;
use pgmq::PGMQueue;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};
use crate::messaging::{DispatchMessage, QueuedMessage, TaskQueue};

#[derive(Debug, Clone)]
pub struct PgmqTaskQueue {
    pgmq: PGMQueue,
    queue_name: String,
}

fn queue_err(operation: &str, err: impl std::fmt::Display) -> DispatchError {
    DispatchError::transient("task_queue", format!("{operation}: {err}"))
}

impl PgmqTaskQueue {
    /// Connect using a connection string and create the queue when absent.
    pub async fn new(database_url: &str, queue_name: &str) -> Result<Self> {
        let pgmq = PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| queue_err("connect", e))?;
        let queue = Self {
            pgmq,
            queue_name: queue_name.to_string(),
        };
        queue.ensure_queue().await?;
        Ok(queue)
    }

    /// Reuse an existing connection pool (BYOP - Bring Your Own Pool).
    pub async fn new_with_pool(pool: sqlx::PgPool, queue_name: &str) -> Result<Self> {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        let queue = Self {
            pgmq,
            queue_name: queue_name.to_string(),
        };
        queue.ensure_queue().await?;
        Ok(queue)
    }

    async fn ensure_queue(&self) -> Result<()> {
        debug!(queue = %self.queue_name, "📋 ensuring queue exists");
        self.pgmq
            .create(&self.queue_name)
            .await
            .map_err(|e| queue_err("create", e))
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl TaskQueue for PgmqTaskQueue {
    async fn send(&self, message: &DispatchMessage) -> Result<i64> {
        let message_id = self
            .pgmq
            .send(&self.queue_name, message)
            .await
            .map_err(|e| queue_err("send", e))?;
        debug!(
            queue = %self.queue_name,
            task_id = %message.task_id,
            attempt = message.attempt,
            message_id,
            "📤 dispatch notification sent"
        );
        Ok(message_id)
    }

    async fn send_delayed(&self, message: &DispatchMessage, delay: Duration) -> Result<i64> {
        let message_id = self
            .pgmq
            .send_delay(&self.queue_name, message, delay.as_secs())
            .await
            .map_err(|e| queue_err("send_delay", e))?;
        debug!(
            queue = %self.queue_name,
            task_id = %message.task_id,
            attempt = message.attempt,
            delay_seconds = delay.as_secs(),
            message_id,
            "📤 delayed dispatch notification scheduled"
        );
        Ok(message_id)
    }

    async fn read(&self, visibility_timeout: Duration, limit: usize) -> Result<Vec<QueuedMessage>> {
        let vt = visibility_timeout.as_secs() as i32;
        let raw = self
            .pgmq
            .read_batch::<serde_json::Value>(&self.queue_name, Some(vt), limit as i32)
            .await
            .map_err(|e| queue_err("read_batch", e))?
            .unwrap_or_default();

        let mut delivered = Vec::with_capacity(raw.len());
        for message in raw {
            match serde_json::from_value::<DispatchMessage>(message.message.clone()) {
                Ok(parsed) => delivered.push(QueuedMessage {
                    receipt: message.msg_id,
                    delivery_count: message.read_ct,
                    message: parsed,
                }),
                Err(err) => {
                    // Unparseable notification: archive so it stops
                    // redelivering, keep the payload for inspection.
                    warn!(
                        queue = %self.queue_name,
                        message_id = message.msg_id,
                        error = %err,
                        "archiving malformed dispatch notification"
                    );
                    self.archive(message.msg_id).await?;
                }
            }
        }
        Ok(delivered)
    }

    async fn ack(&self, receipt: i64) -> Result<()> {
        self.pgmq
            .delete(&self.queue_name, receipt)
            .await
            .map_err(|e| queue_err("delete", e))?;
        Ok(())
    }

    async fn archive(&self, receipt: i64) -> Result<()> {
        self.pgmq
            .archive(&self.queue_name, receipt)
            .await
            .map_err(|e| queue_err("archive", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    // Requires a PostgreSQL database with the pgmq extension; skipped
    // without TEST_DATABASE_URL.
    #[tokio::test]
    async fn send_read_ack_round_trip() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            println!("Skipping pgmq queue test - no TEST_DATABASE_URL provided");
            return;
        };

        let queue = PgmqTaskQueue::new(&url, "dispatch_queue_test")
            .await
            .expect("failed to create pgmq queue");

        let message = DispatchMessage {
            task_id: Uuid::new_v4(),
            task_type: "text:generation".to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        queue.send(&message).await.unwrap();

        let delivered = queue.read(Duration::from_secs(5), 10).await.unwrap();
        let ours: Vec<_> = delivered
            .into_iter()
            .filter(|m| m.message.task_id == message.task_id)
            .collect();
        assert_eq!(ours.len(), 1);
        queue.ack(ours[0].receipt).await.unwrap();
    }
}
