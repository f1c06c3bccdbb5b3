//! # Dispatch Error Types
//!
//! Structured error handling for the dispatch core using thiserror.
//!
//! The taxonomy separates failures that belong to a task (validation,
//! worker execution, timeout) from failures that belong to the
//! infrastructure around it (store, queue, registry). Infrastructure
//! transience is absorbed by bounded internal retries and never fails a
//! task directly; only exhaustion of the task's own attempt budget
//! produces a terminal FAILED/TIMEOUT record.

use thiserror::Error;
use uuid::Uuid;

/// Crate-wide error type covering every dispatch failure class.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Transition conflict for task {task_id}: {message}")]
    Conflict { task_id: Uuid, message: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },

    #[error("Worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },

    #[error("Transient infrastructure error: {component}: {message}")]
    TransientInfra { component: String, message: String },

    #[error("Worker execution error on {worker_id}: {message}")]
    WorkerExecution { worker_id: String, message: String },

    #[error("Timeout: operation {operation} exceeded {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },
}

impl DispatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(task_id: Uuid, message: impl Into<String>) -> Self {
        Self::Conflict {
            task_id,
            message: message.into(),
        }
    }

    pub fn task_not_found(task_id: Uuid) -> Self {
        Self::TaskNotFound { task_id }
    }

    pub fn worker_not_found(worker_id: impl Into<String>) -> Self {
        Self::WorkerNotFound {
            worker_id: worker_id.into(),
        }
    }

    pub fn transient(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientInfra {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn worker_execution(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkerExecution {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Lost a transition race. Callers discard the work item silently.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound { .. } | Self::WorkerNotFound { .. })
    }

    /// Whether an internal retry (with backoff) may succeed. Conflicts and
    /// validation failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientInfra { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_not_retryable() {
        let err = DispatchError::conflict(Uuid::nil(), "another consumer won");
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_infra_is_retryable() {
        let err = DispatchError::transient("task_queue", "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
    }

    #[test]
    fn not_found_covers_tasks_and_workers() {
        assert!(DispatchError::task_not_found(Uuid::nil()).is_not_found());
        assert!(DispatchError::worker_not_found("worker-1").is_not_found());
        assert!(!DispatchError::validation("bad spec").is_not_found());
    }
}
