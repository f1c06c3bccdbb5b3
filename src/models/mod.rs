//! Data models for the dispatch core: the persisted task record and the
//! registry's view of a worker instance.

pub mod task;
pub mod worker;

pub use task::{DispatchRecord, NewTask, Task, TaskErrorDetail, TaskErrorKind, TaskView};
pub use worker::{Worker, WorkerRegistration};
