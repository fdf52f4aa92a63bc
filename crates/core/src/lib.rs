//! `sokrates-core`: task queue domain building blocks.
//!
//! This crate contains the **pure domain**: identifiers, the task record and
//! its state machine, error audit records, and the payload file format.
//! Storage, execution and process supervision live in the outer crates.

pub mod error;
pub mod error_record;
pub mod id;
pub mod payload;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use error_record::ErrorRecord;
pub use id::TaskId;
pub use payload::{RawSubtask, Subtask, SubtaskEntry, TaskFile};
pub use task::{NewTask, StatusUpdate, Task, TaskStatus, TRANSITIONS};
