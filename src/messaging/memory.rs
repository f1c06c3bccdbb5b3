//! In-memory task queue with the same visibility-timeout semantics as the
//! pgmq implementation, for tests and embedded single-process use.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::error::{DispatchError, Result};
use crate::messaging::{DispatchMessage, QueuedMessage, TaskQueue};

struct QueueEntry {
    id: i64,
    visible_at: Instant,
    delivery_count: i32,
    message: DispatchMessage,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    entries: Vec<QueueEntry>,
    archived: Vec<QueueEntry>,
}

#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, message: &DispatchMessage, delay: Duration) -> i64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push(QueueEntry {
            id,
            visible_at: Instant::now() + delay,
            delivery_count: 0,
            message: message.clone(),
        });
        id
    }

    /// Messages currently waiting (visible or not). Test observability.
    pub fn depth(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn archived_count(&self) -> usize {
        self.state.lock().archived.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn send(&self, message: &DispatchMessage) -> Result<i64> {
        Ok(self.enqueue(message, Duration::ZERO))
    }

    async fn send_delayed(&self, message: &DispatchMessage, delay: Duration) -> Result<i64> {
        Ok(self.enqueue(message, delay))
    }

    async fn read(&self, visibility_timeout: Duration, limit: usize) -> Result<Vec<QueuedMessage>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut delivered = Vec::new();
        for entry in state.entries.iter_mut() {
            if delivered.len() >= limit {
                break;
            }
            if entry.visible_at <= now {
                entry.visible_at = now + visibility_timeout;
                entry.delivery_count += 1;
                delivered.push(QueuedMessage {
                    receipt: entry.id,
                    delivery_count: entry.delivery_count,
                    message: entry.message.clone(),
                });
            }
        }
        Ok(delivered)
    }

    async fn ack(&self, receipt: i64) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.id != receipt);
        if state.entries.len() == before {
            return Err(DispatchError::transient(
                "task_queue",
                format!("unknown receipt {receipt}"),
            ));
        }
        Ok(())
    }

    async fn archive(&self, receipt: i64) -> Result<()> {
        let mut state = self.state.lock();
        let position = state.entries.iter().position(|entry| entry.id == receipt);
        match position {
            Some(index) => {
                let entry = state.entries.remove(index);
                state.archived.push(entry);
                Ok(())
            }
            None => Err(DispatchError::transient(
                "task_queue",
                format!("unknown receipt {receipt}"),
            )),
        }
    }
}
