//! Postgres-backed task store.
//!
//! The atomic conditional transition is a single `UPDATE ... WHERE task_id
//! AND status [AND attempt_token] ... RETURNING *`: zero rows means the
//! expectation failed and the caller lost the race. All queries use the
//! runtime sqlx API so the crate builds without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{DispatchError, Result};
use crate::models::{Task, TaskErrorDetail};
use crate::state_machine::{TaskStatus, TaskTransition};
use crate::store::TaskStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dispatch_tasks (
    task_id UUID PRIMARY KEY,
    task_type TEXT NOT NULL,
    spec JSONB NOT NULL,
    payload_ref JSONB NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    attempt_token BIGINT,
    assigned_worker TEXT,
    result JSONB,
    error JSONB,
    dispatch_history JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dispatch_tasks_status_updated
    ON dispatch_tasks (status, updated_at);
CREATE INDEX IF NOT EXISTS idx_dispatch_tasks_expires
    ON dispatch_tasks (expires_at);
"#;

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

/// Raw row shape; JSONB columns decode into `serde_json::Value` first and
/// convert into the typed record afterwards.
#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: Uuid,
    task_type: String,
    spec: serde_json::Value,
    payload_ref: serde_json::Value,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    attempt_token: Option<i64>,
    assigned_worker: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    dispatch_history: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DispatchError;

    fn try_from(row: TaskRow) -> Result<Task> {
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|e| DispatchError::serialization(e))?;
        let error: Option<TaskErrorDetail> = row
            .error
            .map(serde_json::from_value)
            .transpose()?;
        Ok(Task {
            task_id: row.task_id,
            task_type: row.task_type,
            spec: row.spec,
            payload_ref: row.payload_ref,
            status,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            attempt_token: row.attempt_token,
            assigned_worker: row.assigned_worker,
            result: row.result,
            error,
            dispatch_history: serde_json::from_value(row.dispatch_history)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

fn store_err(err: sqlx::Error) -> DispatchError {
    DispatchError::transient("task_store", err.to_string())
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a fresh pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(store_err)?;
        Ok(Self::new(pool))
    }

    /// Create the backing table and indexes when absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists_unexpired(&self, task_id: Uuid) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM dispatch_tasks WHERE task_id = $1 AND expires_at > NOW()",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create(&self, task: Task) -> Result<()> {
        let error = task.error.as_ref().map(serde_json::to_value).transpose()?;
        let history = serde_json::to_value(&task.dispatch_history)?;
        let result = sqlx::query(
            r#"
            INSERT INTO dispatch_tasks (
                task_id, task_type, spec, payload_ref, status,
                attempt_count, max_attempts, attempt_token, assigned_worker,
                result, error, dispatch_history, created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task.task_id)
        .bind(&task.task_type)
        .bind(&task.spec)
        .bind(&task.payload_ref)
        .bind(task.status.to_string())
        .bind(task.attempt_count)
        .bind(task.max_attempts)
        .bind(task.attempt_token)
        .bind(&task.assigned_worker)
        .bind(&task.result)
        .bind(error)
        .bind(history)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::conflict(
                task.task_id,
                "task id already exists",
            ));
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT * FROM dispatch_tasks WHERE task_id = $1 AND expires_at > NOW()",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(Task::try_from)
            .transpose()?
            .ok_or_else(|| DispatchError::task_not_found(task_id))
    }

    async fn transition(&self, task_id: Uuid, transition: TaskTransition) -> Result<Task> {
        if !transition
            .expected_status
            .can_transition_to(transition.target_status)
        {
            return Err(DispatchError::conflict(
                task_id,
                format!(
                    "transition {} -> {} is not permitted",
                    transition.expected_status, transition.target_status
                ),
            ));
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE dispatch_tasks SET updated_at = NOW(), status = ");
        builder.push_bind(transition.target_status.to_string());

        if transition.clear_assignment {
            builder.push(", attempt_token = NULL, assigned_worker = NULL");
        }
        if let Some(attempt_count) = transition.set_attempt_count {
            builder.push(", attempt_count = ").push_bind(attempt_count);
        }
        if let Some(token) = transition.set_attempt_token {
            builder.push(", attempt_token = ").push_bind(token);
        }
        if let Some(ref worker_id) = transition.set_assigned_worker {
            builder
                .push(", assigned_worker = ")
                .push_bind(worker_id.clone());
        }
        if let Some(ref result) = transition.set_result {
            builder.push(", result = ").push_bind(result.clone());
        }
        if let Some(ref error) = transition.set_error {
            builder
                .push(", error = ")
                .push_bind(serde_json::to_value(error)?);
        }
        if let Some(ref record) = transition.push_dispatch {
            builder
                .push(", dispatch_history = dispatch_history || ")
                .push_bind(serde_json::to_value(vec![record])?);
        }

        builder.push(" WHERE task_id = ").push_bind(task_id);
        builder
            .push(" AND status = ")
            .push_bind(transition.expected_status.to_string());
        if let Some(expected_token) = transition.expected_attempt_token {
            builder
                .push(" AND attempt_token = ")
                .push_bind(expected_token);
        }
        if let Some(attempt_count) = transition.set_attempt_count {
            // Attempt budget guard: never allow attempt_count past max_attempts.
            builder
                .push(" AND max_attempts >= ")
                .push_bind(attempt_count);
        }
        builder.push(" AND expires_at > NOW() RETURNING *");

        let row: Option<TaskRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => Task::try_from(row),
            None if self.exists_unexpired(task_id).await? => Err(DispatchError::conflict(
                task_id,
                format!(
                    "expected status {} (token {:?}) no longer holds",
                    transition.expected_status, transition.expected_attempt_token
                ),
            )),
            None => Err(DispatchError::task_not_found(task_id)),
        }
    }

    async fn processing_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM dispatch_tasks
            WHERE status = $1 AND updated_at < $2 AND expires_at > NOW()
            ORDER BY updated_at ASC
            "#,
        )
        .bind(TaskStatus::Processing.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn delete_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispatch_tasks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}
