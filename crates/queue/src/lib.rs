//! `sokrates-queue`: persistent task queue and processing.
//!
//! - [`store`]: durable task storage ([`QueueStore`], SQLite and in-memory).
//! - [`tracker`]: validated status changes.
//! - [`policy`]: retry, backoff and dead-letter decisions.
//! - [`executor`] / [`runner`]: the execution boundary and the default
//!   sequential task-file runner.
//! - [`processor`]: one processing pass over the pending tasks.

pub mod executor;
pub mod policy;
pub mod processor;
pub mod runner;
pub mod store;
pub mod tracker;

pub use executor::{
    ExecutionOutcome, ExecutionSummary, SubtaskDetail, SubtaskStatus, TaskExecutor,
};
pub use policy::{BackoffStrategy, ErrorClass, FailureAction, FailurePolicy, RetryPolicy};
pub use processor::{PassReport, ProcessError, Processor, ProcessorConfig, TaskOutcome};
pub use runner::{SequentialTaskRunner, SubtaskContext, SubtaskError, SubtaskHandler};
pub use store::{InMemoryQueueStore, QueueStats, QueueStore, SqliteQueueStore, StoreError};
pub use tracker::StatusTracker;
