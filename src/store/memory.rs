//! In-memory task store.
//!
//! Shares the exact transition semantics of the Postgres store via
//! [`TaskTransition::apply`], executed under the map entry's shard lock so
//! concurrent transitions on the same task serialize. Used by tests and
//! embedded single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::Task;
use crate::state_machine::{TaskStatus, TaskTransition};
use crate::store::TaskStore;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<Uuid, Task>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<()> {
        match self.tasks.entry(task.task_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DispatchError::conflict(
                task.task_id,
                "task id already exists",
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(task);
                Ok(())
            }
        }
    }

    async fn get(&self, task_id: Uuid) -> Result<Task> {
        let expired = {
            match self.tasks.get(&task_id) {
                None => return Err(DispatchError::task_not_found(task_id)),
                Some(entry) => entry.is_expired(Utc::now()),
            }
        };
        if expired {
            // Lazy eviction on read.
            self.tasks.remove(&task_id);
            return Err(DispatchError::task_not_found(task_id));
        }
        self.tasks
            .get(&task_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DispatchError::task_not_found(task_id))
    }

    async fn transition(&self, task_id: Uuid, transition: TaskTransition) -> Result<Task> {
        let now = Utc::now();
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| DispatchError::task_not_found(task_id))?;
        if entry.is_expired(now) {
            drop(entry);
            self.tasks.remove(&task_id);
            return Err(DispatchError::task_not_found(task_id));
        }
        transition.apply(entry.value_mut(), now)?;
        Ok(entry.clone())
    }

    async fn processing_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let now = Utc::now();
        Ok(self
            .tasks
            .iter()
            .filter(|entry| {
                entry.status == TaskStatus::Processing
                    && entry.updated_at < cutoff
                    && !entry.is_expired(now)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !task.is_expired(now));
        Ok((before - self.tasks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use serde_json::json;

    fn new_task(ttl_seconds: i64) -> Task {
        Task::from_request(
            NewTask {
                task_type: "text:generation".to_string(),
                spec: json!({}),
                payload_ref: json!({}),
                max_attempts: Some(3),
                ttl_seconds: Some(ttl_seconds),
            },
            3,
            chrono::Duration::seconds(3600),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryTaskStore::new();
        let task = new_task(3600);
        let task_id = task.task_id;
        store.create(task.clone()).await.unwrap();
        let fetched = store.get(task_id).await.unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = InMemoryTaskStore::new();
        let task = new_task(3600);
        store.create(task.clone()).await.unwrap();
        let err = store.create(task).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn expired_task_reads_as_not_found() {
        let store = InMemoryTaskStore::new();
        let mut task = new_task(3600);
        task.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let task_id = task.task_id;
        store.create(task).await.unwrap();
        let err = store.get(task_id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn transition_applies_conditionally() {
        let store = InMemoryTaskStore::new();
        let task = new_task(3600);
        let task_id = task.task_id;
        store.create(task).await.unwrap();

        let updated = store
            .transition(task_id, TaskTransition::dispatch("worker-a", 1, 1))
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Processing);

        let err = store
            .transition(task_id, TaskTransition::dispatch("worker-b", 1, 1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn concurrent_dispatch_has_exactly_one_winner() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryTaskStore::new());
        let task = new_task(3600);
        let task_id = task.task_id;
        store.create(task).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition(
                        task_id,
                        TaskTransition::dispatch(format!("worker-{i}"), 1, 1),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn sweep_only_sees_stale_processing() {
        let store = InMemoryTaskStore::new();
        let task = new_task(3600);
        let task_id = task.task_id;
        store.create(task).await.unwrap();
        store
            .transition(task_id, TaskTransition::dispatch("worker-a", 1, 1))
            .await
            .unwrap();

        let stale = store
            .processing_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        let fresh = store
            .processing_older_than(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(fresh.is_empty());
    }
}
