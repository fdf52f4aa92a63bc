//! Status tracking on top of a [`QueueStore`].

use sokrates_core::{StatusUpdate, Task, TaskId, TaskStatus, TRANSITIONS};
use tracing::debug;

use crate::store::{QueueStore, StoreError};

/// Funnels every status change through the store's validated write path.
#[derive(Debug, Clone)]
pub struct StatusTracker<S> {
    store: S,
}

impl<S: QueueStore> StatusTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Move a task to `status`, recording `result` as the outcome text.
    ///
    /// For `failed` and `dead_letter` the text is also kept as `last_error`.
    pub async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<Task, StoreError> {
        let mut update = StatusUpdate::new(status);
        if let Some(text) = result {
            update = update.with_result(text);
        }
        let task = self.store.update_status(task_id, update).await?;
        debug!(%task_id, status = %task.status, "task status updated");
        Ok(task)
    }

    /// Mark a task `in_progress` and set its attempt counter.
    pub async fn begin_attempt(&self, task_id: TaskId, attempt: u32) -> Result<Task, StoreError> {
        let update = StatusUpdate::new(TaskStatus::InProgress).with_attempt(attempt);
        let task = self.store.update_status(task_id, update).await?;
        debug!(%task_id, attempt, "task attempt started");
        Ok(task)
    }

    /// The allowed `(from, to)` status pairs.
    pub fn transitions() -> &'static [(TaskStatus, TaskStatus)] {
        TRANSITIONS
    }
}
