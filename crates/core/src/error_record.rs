//! Append-only failure audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// One failed execution attempt. Never mutated or deleted once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub task_id: TaskId,
    pub message: String,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(task_id: TaskId, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            task_id,
            message: message.into(),
            attempt,
            recorded_at: Utc::now(),
        }
    }
}
