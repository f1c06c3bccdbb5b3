//! # Conditional Transitions
//!
//! A [`TaskTransition`] describes one edge of the task state machine: the
//! expectations that must hold on the stored record (status and, for
//! completion-driven edges, the attempt token) plus the field effects of
//! taking the edge. Stores apply it atomically; a failed expectation is a
//! [`crate::error::DispatchError::Conflict`], which callers discard
//! silently because it means another component already handled the task.

use chrono::{DateTime, Utc};

use crate::error::{DispatchError, Result};
use crate::models::task::{DispatchRecord, Task, TaskErrorDetail};
use crate::state_machine::TaskStatus;

/// One conditional edge of the task state machine.
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub expected_status: TaskStatus,
    /// Checked in addition to the status when the edge is completion-driven.
    /// A mismatch means the task was reclaimed and re-dispatched since the
    /// attempt this update belongs to.
    pub expected_attempt_token: Option<i64>,
    pub target_status: TaskStatus,
    pub set_attempt_count: Option<i32>,
    pub set_attempt_token: Option<i64>,
    pub set_assigned_worker: Option<String>,
    pub clear_assignment: bool,
    pub set_result: Option<serde_json::Value>,
    pub set_error: Option<TaskErrorDetail>,
    pub push_dispatch: Option<DispatchRecord>,
}

impl TaskTransition {
    fn edge(expected: TaskStatus, target: TaskStatus) -> Self {
        Self {
            expected_status: expected,
            expected_attempt_token: None,
            target_status: target,
            set_attempt_count: None,
            set_attempt_token: None,
            set_assigned_worker: None,
            clear_assignment: false,
            set_result: None,
            set_error: None,
            push_dispatch: None,
        }
    }

    /// PENDING→PROCESSING: assign a worker and charge the attempt budget.
    /// `attempt` is the new attempt count, `token` the new attempt token;
    /// both advance together, exactly once per dispatch.
    pub fn dispatch(worker_id: impl Into<String>, attempt: i32, token: i64) -> Self {
        let worker_id = worker_id.into();
        let mut transition = Self::edge(TaskStatus::Pending, TaskStatus::Processing);
        transition.set_attempt_count = Some(attempt);
        transition.set_attempt_token = Some(token);
        transition.set_assigned_worker = Some(worker_id.clone());
        transition.push_dispatch = Some(DispatchRecord {
            attempt,
            worker_id,
            dispatched_at: Utc::now(),
        });
        transition
    }

    /// PROCESSING→PENDING: reclaim for another attempt. The attempt budget
    /// was already charged at dispatch time, so nothing is incremented.
    pub fn reclaim(expected_token: i64) -> Self {
        let mut transition = Self::edge(TaskStatus::Processing, TaskStatus::Pending);
        transition.expected_attempt_token = Some(expected_token);
        transition.clear_assignment = true;
        transition
    }

    /// PROCESSING→SUCCESS with the opaque result stored unchanged.
    pub fn succeed(expected_token: i64, result: serde_json::Value) -> Self {
        let mut transition = Self::edge(TaskStatus::Processing, TaskStatus::Success);
        transition.expected_attempt_token = Some(expected_token);
        transition.clear_assignment = true;
        transition.set_result = Some(result);
        transition
    }

    /// PROCESSING→FAILED: the attempt budget is exhausted.
    pub fn fail(expected_token: i64, error: TaskErrorDetail) -> Self {
        let mut transition = Self::edge(TaskStatus::Processing, TaskStatus::Failed);
        transition.expected_attempt_token = Some(expected_token);
        transition.clear_assignment = true;
        transition.set_error = Some(error);
        transition
    }

    /// PROCESSING→TIMEOUT: no completion arrived and the budget is spent.
    pub fn time_out(expected_token: i64, error: TaskErrorDetail) -> Self {
        let mut transition = Self::edge(TaskStatus::Processing, TaskStatus::Timeout);
        transition.expected_attempt_token = Some(expected_token);
        transition.clear_assignment = true;
        transition.set_error = Some(error);
        transition
    }

    /// Any non-terminal state → CANCELLED.
    pub fn cancel(expected: TaskStatus) -> Self {
        let mut transition = Self::edge(expected, TaskStatus::Cancelled);
        transition.clear_assignment = true;
        transition
    }

    /// Apply this edge to an in-memory record. Used directly by the memory
    /// store; the Postgres store expresses the same expectations in its
    /// conditional `UPDATE`.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> Result<()> {
        if task.status != self.expected_status {
            return Err(DispatchError::conflict(
                task.task_id,
                format!(
                    "expected status {}, found {}",
                    self.expected_status, task.status
                ),
            ));
        }
        if let Some(expected_token) = self.expected_attempt_token {
            if task.attempt_token != Some(expected_token) {
                return Err(DispatchError::conflict(
                    task.task_id,
                    format!(
                        "attempt token mismatch: expected {expected_token}, found {:?}",
                        task.attempt_token
                    ),
                ));
            }
        }
        if !task.status.can_transition_to(self.target_status) {
            return Err(DispatchError::conflict(
                task.task_id,
                format!(
                    "transition {} -> {} is not permitted",
                    task.status, self.target_status
                ),
            ));
        }
        if let Some(attempt_count) = self.set_attempt_count {
            if attempt_count > task.max_attempts {
                return Err(DispatchError::conflict(
                    task.task_id,
                    format!(
                        "attempt budget exhausted: {attempt_count} > {}",
                        task.max_attempts
                    ),
                ));
            }
            task.attempt_count = attempt_count;
        }
        if self.clear_assignment {
            task.attempt_token = None;
            task.assigned_worker = None;
        }
        if let Some(token) = self.set_attempt_token {
            task.attempt_token = Some(token);
        }
        if let Some(ref worker_id) = self.set_assigned_worker {
            task.assigned_worker = Some(worker_id.clone());
        }
        if let Some(ref result) = self.set_result {
            task.result = Some(result.clone());
        }
        if let Some(ref error) = self.set_error {
            task.error = Some(error.clone());
        }
        if let Some(ref record) = self.push_dispatch {
            task.dispatch_history.push(record.clone());
        }
        task.status = self.target_status;
        task.updated_at = now;
        Ok(())
    }
}
