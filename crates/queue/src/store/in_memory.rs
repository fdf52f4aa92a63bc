use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use sokrates_core::{ErrorRecord, NewTask, StatusUpdate, Task, TaskId, TaskStatus};

use super::{QueueStats, QueueStore, StoreError};

#[derive(Debug, Default)]
struct State {
    tasks: Vec<Task>,
    errors: Vec<ErrorRecord>,
}

/// In-memory queue store for tests/dev.
///
/// Tasks keep insertion order. [`set_available`](Self::set_available) lets a
/// caller simulate a storage outage.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    closes: AtomicUsize,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// While unavailable, every operation fails with [`StoreError::Storage`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of times [`QueueStore::close`] has been called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("store unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError> {
        let mut state = self.state()?;
        if state.tasks.iter().any(|t| t.task_id == task.task_id) {
            return Err(StoreError::AlreadyExists(task.task_id));
        }
        let task = task.into_task(Utc::now());
        state.tasks.push(task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state()?;
        Ok(state.tasks.iter().find(|t| t.task_id == task_id).cloned())
    }

    async fn get_pending_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError> {
        let state = self.state()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        update: StatusUpdate,
    ) -> Result<Task, StoreError> {
        let mut state = self.state()?;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.task_id == task_id)
            .ok_or(StoreError::NotFound(task_id))?;

        // Apply to a copy so a rejected transition leaves the row untouched.
        let mut updated = task.clone();
        updated.apply(&update, Utc::now())?;
        *task = updated.clone();
        Ok(updated)
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if !state.tasks.iter().any(|t| t.task_id == record.task_id) {
            return Err(StoreError::NotFound(record.task_id));
        }
        state.errors.push(record.clone());
        Ok(())
    }

    async fn list_errors(&self, task_id: TaskId) -> Result<Vec<ErrorRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .errors
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.state()?;
        let mut stats = QueueStats::default();
        for task in &state.tasks {
            stats.add(task.status, 1);
        }
        Ok(stats)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
