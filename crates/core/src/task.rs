//! Task record and its state machine.
//!
//! ## Transition table
//!
//! | From | To | Trigger |
//! |---|---|---|
//! | pending | in_progress | processor begins execution |
//! | in_progress | completed | executor succeeds |
//! | in_progress | failed | executor fails, failure policy consulted |
//! | failed | in_progress | retry attempt begins |
//! | failed | completed | retry eventually succeeds |
//! | failed | dead_letter | retry budget exhausted |
//! | failed | failed | policy declines further retries |
//!
//! `failed` doubles as the retry-pending state while a task is mid-retry.

use core::fmt;
use core::str::FromStr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;

/// Persisted status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

/// Every allowed `(from, to)` pair.
pub const TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (TaskStatus::Pending, TaskStatus::InProgress),
    (TaskStatus::InProgress, TaskStatus::Completed),
    (TaskStatus::InProgress, TaskStatus::Failed),
    (TaskStatus::Failed, TaskStatus::InProgress),
    (TaskStatus::Failed, TaskStatus::Completed),
    (TaskStatus::Failed, TaskStatus::DeadLetter),
    (TaskStatus::Failed, TaskStatus::Failed),
];

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    /// Terminal states: nothing in this core moves a task out of them
    /// except a retry already in flight (`failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        TRANSITIONS.contains(&(*self, to))
    }

    pub fn ensure_transition(&self, to: TaskStatus) -> DomainResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(*self, to))
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    /// Payload reference, interpreted only by the executor.
    pub file_path: PathBuf,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Apply a validated status change.
    ///
    /// `updated_at` is moved forward to `now` (never backwards, even if the
    /// caller's clock reading is older than the last write).
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.ensure_transition(update.status)?;

        self.status = update.status;
        if let Some(attempt) = update.attempt {
            self.attempt_count = attempt;
        }
        if let Some(text) = &update.result {
            self.result = Some(text.clone());
            if update.records_error() {
                self.last_error = Some(text.clone());
            }
        }
        self.updated_at = now.max(self.updated_at);
        Ok(())
    }
}

/// Insertion request for a new `pending` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub task_id: TaskId,
    pub file_path: PathBuf,
}

impl NewTask {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            task_id: TaskId::new(),
            file_path: file_path.into(),
        }
    }

    /// Use a caller-chosen id (imports, tests).
    pub fn with_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            task_id: self.task_id,
            file_path: self.file_path,
            status: TaskStatus::Pending,
            attempt_count: 0,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A requested status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub result: Option<String>,
    /// New `attempt_count`, when the write starts an attempt.
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            attempt: None,
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Whether the result text is an error message as well.
    pub fn records_error(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::DeadLetter)
    }
}
