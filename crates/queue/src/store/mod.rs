//! Durable task storage.
//!
//! The [`QueueStore`] trait is the only way the rest of the queue touches
//! persisted state. Two implementations ship with the crate:
//!
//! - [`SqliteQueueStore`]: the production store, one SQLite file shared by the
//!   daemon and any number of enqueuing clients.
//! - [`InMemoryQueueStore`]: used by tests and local tooling.
//!
//! ## Status writes
//!
//! [`QueueStore::update_status`] is a compare-and-set: the store reads the
//! current row, validates the transition against
//! [`TaskStatus::can_transition_to`](sokrates_core::TaskStatus::can_transition_to),
//! and only writes if the status is still the one it read. A writer that loses
//! the race gets [`StoreError::Conflict`] instead of silently overwriting.

mod in_memory;
mod sqlite;

use std::sync::Arc;

use serde::Serialize;
use sokrates_core::{DomainError, ErrorRecord, NewTask, StatusUpdate, Task, TaskId, TaskStatus};

pub use in_memory::InMemoryQueueStore;
pub use sqlite::SqliteQueueStore;

/// Persistent task queue.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new task in `pending` status.
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Get a task by ID.
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Pending tasks in insertion order. `None` means no limit.
    async fn get_pending_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError>;

    /// Tasks in insertion order, optionally filtered by status.
    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Validate and apply a status change. Returns the task as written.
    async fn update_status(
        &self,
        task_id: TaskId,
        update: StatusUpdate,
    ) -> Result<Task, StoreError>;

    /// Append an entry to a task's error history.
    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError>;

    /// Error history for a task, oldest first.
    async fn list_errors(&self, task_id: TaskId) -> Result<Vec<ErrorRecord>, StoreError>;

    /// Task counts per status.
    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Release any held connection. Safe to call repeatedly; the next
    /// operation reopens the store.
    async fn close(&self);
}

#[async_trait::async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError> {
        (**self).enqueue(task).await
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get_task(task_id).await
    }

    async fn get_pending_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError> {
        (**self).get_pending_tasks(limit).await
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        (**self).list_tasks(status, limit).await
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        update: StatusUpdate,
    ) -> Result<Task, StoreError> {
        (**self).update_status(task_id, update).await
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        (**self).append_error(record).await
    }

    async fn list_errors(&self, task_id: TaskId) -> Result<Vec<ErrorRecord>, StoreError> {
        (**self).list_errors(task_id).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        (**self).stats().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("task {0} changed status concurrently")]
    Conflict(TaskId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("corrupt task row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// True for rejected status transitions.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, StoreError::Domain(DomainError::InvalidTransition { .. }))
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl QueueStats {
    pub fn add(&mut self, status: TaskStatus, count: usize) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += count;
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::DeadLetter => self.dead_letter,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.count(*s)).sum()
    }
}
