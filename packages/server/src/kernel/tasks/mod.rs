//! The durable task pipeline: model, store, log, worker pool.

pub mod log;
pub mod store;
pub mod task;
pub mod worker;

pub use log::{LogStatus, NewLog, PublishingLog};
pub use store::{CreateReport, StatusCounts, TaskFilter, TaskPatch, TaskStore};
pub use task::{NewTask, PublishingTask, TaskOutcome, TaskStatus};
pub use worker::{RunOnceReport, WorkerPool, WorkerPoolConfig};
