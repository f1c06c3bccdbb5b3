//! HTTP worker client.
//!
//! Issues the execution call as `POST {address}/api/v1/tasks`. A 2xx answer
//! is an ack, 503 is a reject (worker at capacity), and any other status
//! or transport failure is an immediate call failure charged against the
//! task's attempt budget by the dispatcher.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::models::Worker;
use crate::worker::{ExecutionRequest, SubmitResponse, WorkerClient};

#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(submit_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(submit_timeout)
            .build()
            .map_err(|e| DispatchError::configuration("worker_client", e.to_string()))?;
        Ok(Self { client })
    }

    fn submit_url(worker: &Worker) -> String {
        format!("{}/api/v1/tasks", worker.address.trim_end_matches('/'))
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn submit(&self, worker: &Worker, request: &ExecutionRequest) -> Result<SubmitResponse> {
        let url = Self::submit_url(worker);
        debug!(
            task_id = %request.task_id,
            worker_id = %worker.worker_id,
            url = %url,
            attempt_token = request.attempt_token,
            "issuing execution call"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::worker_execution(&worker.worker_id, e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(SubmitResponse::Accepted),
            StatusCode::SERVICE_UNAVAILABLE => {
                let reason = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "worker busy".to_string());
                Ok(SubmitResponse::Rejected { reason })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DispatchError::worker_execution(
                    &worker.worker_id,
                    format!("submit returned {status}: {body}"),
                ))
            }
        }
    }
}
