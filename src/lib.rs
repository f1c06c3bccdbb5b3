//! # Dispatch Core
//!
//! Distributed task dispatch core: accepts opaque work items, persists
//! their lifecycle state, routes each task through a durable queue to a
//! dynamically discovered pool of executor instances, balances load,
//! enforces timeout/retry budgets, and exposes the latest status until a
//! terminal outcome is reached.
//!
//! ## Architecture
//!
//! Correctness is coordinated across three independently-failing stores
//! (a task store, a durable queue, and a worker registry) with a single
//! primitive: the store's atomic conditional transition. Dispatchers,
//! the timeout monitor and completion callbacks all race freely; exactly
//! one conditional transition wins any given edge, everyone else observes
//! a Conflict and discards. Queue delivery is at-least-once; duplicate
//! notifications are expected and rendered idempotent by that atomicity.
//!
//! ## Module Organization
//!
//! - [`models`] - task records and worker instances
//! - [`state_machine`] - lifecycle states and conditional transitions
//! - [`store`] - task store trait, memory and Postgres implementations
//! - [`messaging`] - task queue trait, memory and pgmq implementations
//! - [`registry`] - worker discovery, heartbeats, load-ordered lookup
//! - [`worker`] - execution call contract and the HTTP worker client
//! - [`orchestration`] - dispatcher, timeout monitor, completion handling,
//!   and the [`orchestration::DispatchSystem`] facade
//! - [`config`] - layered configuration with validated defaults
//! - [`error`] - structured error taxonomy
//! - [`resilience`] - bounded retry for transient infrastructure failures
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dispatch_core::config::DispatchConfig;
//! use dispatch_core::models::NewTask;
//! use dispatch_core::orchestration::DispatchSystem;
//!
//! # async fn example() -> dispatch_core::Result<()> {
//! let config = DispatchConfig::load()?;
//! let system = DispatchSystem::connect(config).await?;
//! system.start();
//!
//! let task_id = system
//!     .create_task(NewTask {
//!         task_type: "text:generation".to_string(),
//!         spec: serde_json::json!({"model": "demo"}),
//!         payload_ref: serde_json::json!({"prompt": "hello"}),
//!         max_attempts: None,
//!         ttl_seconds: None,
//!     })
//!     .await?;
//!
//! let view = system.get_task(task_id).await?;
//! println!("task {} is {}", task_id, view.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod state_machine;
pub mod store;
pub mod worker;

pub use config::DispatchConfig;
pub use error::{DispatchError, Result};
pub use messaging::{DispatchMessage, TaskQueue};
pub use models::{NewTask, Task, TaskErrorDetail, TaskErrorKind, TaskView, Worker, WorkerRegistration};
pub use orchestration::{DispatchOutcome, DispatchSystem};
pub use registry::WorkerRegistry;
pub use state_machine::{TaskStatus, TaskTransition};
pub use store::TaskStore;
pub use worker::{CompletionOutcome, CompletionReport, ExecutionRequest, SubmitResponse, WorkerClient};
