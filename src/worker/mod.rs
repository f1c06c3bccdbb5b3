//! # Worker Execution Contract
//!
//! The dispatch-side contract with executor instances: a [`WorkerClient`]
//! issues the execution call carrying the task payload and attempt token;
//! the worker acknowledges (or rejects) synchronously and reports the
//! outcome later through the completion callback, which arrives as a
//! [`CompletionReport`]. The call is fire-and-forget relative to the
//! dispatch loop; only the ack/reject handshake is awaited.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Task, Worker};

pub use http::HttpWorkerClient;

/// Payload of the execution call issued to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: Uuid,
    pub task_type: String,
    pub spec: serde_json::Value,
    pub payload_ref: serde_json::Value,
    /// Echoed back by the worker in its completion callback; a stale token
    /// there means the attempt was reclaimed in the meantime.
    pub attempt_token: i64,
}

impl ExecutionRequest {
    pub fn from_task(task: &Task, attempt_token: i64) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type.clone(),
            spec: task.spec.clone(),
            payload_ref: task.payload_ref.clone(),
            attempt_token,
        }
    }
}

/// Synchronous answer to the execution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted,
    /// The worker declined the hand-off (typically: at capacity). The
    /// dispatcher treats this like an immediate call failure.
    Rejected { reason: String },
}

/// Outcome reported by a worker through the completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CompletionOutcome {
    Success { result: serde_json::Value },
    Failure {
        message: String,
        #[serde(default)]
        detail: serde_json::Value,
    },
}

/// Completion callback payload received from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: Uuid,
    pub attempt_token: i64,
    #[serde(flatten)]
    pub outcome: CompletionOutcome,
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Issue the execution call to a worker. `Err` means the call itself
    /// failed (connection refused, malformed request, timeout); the
    /// dispatcher charges it against the task's attempt budget.
    async fn submit(&self, worker: &Worker, request: &ExecutionRequest) -> Result<SubmitResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_report_wire_shape() {
        let report = CompletionReport {
            task_id: Uuid::nil(),
            attempt_token: 2,
            outcome: CompletionOutcome::Success {
                result: json!({"text": "ok"}),
            },
        };
        let encoded = serde_json::to_value(&report).unwrap();
        assert_eq!(encoded["attempt_token"], 2);
        assert_eq!(encoded["outcome"], "success");
        assert_eq!(encoded["result"], json!({"text": "ok"}));

        let decoded: CompletionReport = serde_json::from_value(encoded).unwrap();
        match decoded.outcome {
            CompletionOutcome::Success { result } => assert_eq!(result, json!({"text": "ok"})),
            CompletionOutcome::Failure { .. } => panic!("expected success outcome"),
        }
    }

    #[test]
    fn failure_outcome_defaults_detail() {
        let decoded: CompletionReport = serde_json::from_value(json!({
            "task_id": Uuid::nil(),
            "attempt_token": 1,
            "outcome": "failure",
            "message": "model exploded"
        }))
        .unwrap();
        match decoded.outcome {
            CompletionOutcome::Failure { message, detail } => {
                assert_eq!(message, "model exploded");
                assert!(detail.is_null());
            }
            CompletionOutcome::Success { .. } => panic!("expected failure outcome"),
        }
    }
}
