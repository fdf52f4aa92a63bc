//! The boundary between the queue and whatever actually runs a task.
//!
//! The processor never interprets a task's payload. It hands the task's
//! `file_path` to a [`TaskExecutor`] and gets back an [`ExecutionOutcome`]:
//! either a summary of the work done, or a failure already classified as
//! retryable or terminal.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::policy::ErrorClass;

/// Per-subtask status inside an execution summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Completed,
    Failed,
    /// Missing required fields; not executed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtaskDetail {
    pub subtask_id: Option<String>,
    pub status: SubtaskStatus,
    pub message: String,
}

/// Result of a successful execution. Individual subtasks may still have failed.
///
/// Skipped subtasks appear in `details` and `total_tasks` but in neither count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub details: Vec<SubtaskDetail>,
}

impl ExecutionSummary {
    pub fn record(&mut self, detail: SubtaskDetail) {
        match detail.status {
            SubtaskStatus::Completed => self.successful_tasks += 1,
            SubtaskStatus::Failed => self.failed_tasks += 1,
            SubtaskStatus::Skipped => {}
        }
        self.details.push(detail);
    }

    pub fn skipped_tasks(&self) -> usize {
        self.details
            .iter()
            .filter(|d| d.status == SubtaskStatus::Skipped)
            .count()
    }
}

/// What one execution attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success(ExecutionSummary),
    /// Transient failure; another attempt may succeed.
    Retryable(String),
    /// The task cannot succeed as given.
    Terminal(String),
}

impl ExecutionOutcome {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// The failure class, or `None` on success.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Success(_) => None,
            Self::Retryable(_) => Some(ErrorClass::Retryable),
            Self::Terminal(_) => Some(ErrorClass::Terminal),
        }
    }
}

/// Runs the work a task's payload describes.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, file_path: &Path) -> ExecutionOutcome;
}

#[async_trait::async_trait]
impl<E> TaskExecutor for Arc<E>
where
    E: TaskExecutor + ?Sized,
{
    async fn execute(&self, file_path: &Path) -> ExecutionOutcome {
        (**self).execute(file_path).await
    }
}
