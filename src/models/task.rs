//! # Task Model
//!
//! The task record persisted by the [`crate::store::TaskStore`].
//!
//! A task is created once by the gateway, mutated only through the
//! dispatcher / monitor / completion transitions, and becomes permanently
//! inert once it reaches a terminal state or its ttl expires. The `spec`,
//! `payload_ref` and `result` fields are opaque JSON: the core routes them
//! without interpreting their contents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::state_machine::TaskStatus;

/// Failure class recorded on a terminal FAILED/TIMEOUT task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Validation,
    Dispatch,
    WorkerExecution,
    Timeout,
    Cancelled,
}

/// Structured error detail attached to a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorDetail {
    pub kind: TaskErrorKind,
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl TaskErrorDetail {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// One record per PENDING→PROCESSING transition, kept so a terminal
/// timeout can report every worker that was handed the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub attempt: i32,
    pub worker_id: String,
    pub dispatched_at: DateTime<Utc>,
}

/// Submission payload consumed from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub spec: serde_json::Value,
    pub payload_ref: serde_json::Value,
    /// Attempt budget; falls back to the configured default when absent.
    pub max_attempts: Option<i32>,
    /// Ttl in seconds; falls back to the configured default when absent.
    pub ttl_seconds: Option<i64>,
}

impl NewTask {
    /// Reject malformed submissions up front. Validation failures are
    /// fatal: they are surfaced to the caller and never retried.
    pub fn validate(&self) -> Result<()> {
        if self.task_type.is_empty() {
            return Err(DispatchError::validation("task_type must not be empty"));
        }
        if self.task_type.len() > 128 {
            return Err(DispatchError::validation(
                "task_type must not exceed 128 characters",
            ));
        }
        if self.task_type.chars().any(char::is_whitespace) {
            return Err(DispatchError::validation(
                "task_type must not contain whitespace",
            ));
        }
        if let Some(max_attempts) = self.max_attempts {
            if max_attempts < 1 {
                return Err(DispatchError::validation("max_attempts must be at least 1"));
            }
        }
        if let Some(ttl) = self.ttl_seconds {
            if ttl < 1 {
                return Err(DispatchError::validation("ttl_seconds must be positive"));
            }
        }
        Ok(())
    }
}

/// The persisted task record.
///
/// Invariants maintained by the store transitions:
/// - `attempt_count <= max_attempts` always
/// - `assigned_worker` and `attempt_token` are `Some` iff status is PROCESSING
/// - `result` is `Some` iff status is SUCCESS
/// - `error` is `Some` iff status is FAILED or TIMEOUT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub task_type: String,
    pub spec: serde_json::Value,
    pub payload_ref: serde_json::Value,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub attempt_token: Option<i64>,
    pub assigned_worker: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskErrorDetail>,
    #[serde(default)]
    pub dispatch_history: Vec<DispatchRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh PENDING record from a validated submission.
    pub fn from_request(request: NewTask, default_max_attempts: i32, default_ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = request
            .ttl_seconds
            .map(Duration::seconds)
            .unwrap_or(default_ttl);
        Self {
            task_id: Uuid::new_v4(),
            task_type: request.task_type,
            spec: request.spec,
            payload_ref: request.payload_ref,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts),
            attempt_token: None,
            assigned_worker: None,
            result: None,
            error: None,
            dispatch_history: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Worker ids from the dispatch history, oldest first.
    pub fn assigned_worker_history(&self) -> Vec<String> {
        self.dispatch_history
            .iter()
            .map(|record| record.worker_id.clone())
            .collect()
    }
}

/// Read view served to status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type.clone(),
            status: task.status,
            attempt_count: task.attempt_count,
            max_attempts: task.max_attempts,
            result: task.result.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            expires_at: task.expires_at,
        }
    }
}
