//! Sequential execution of a task file's subtasks.
//!
//! A task file is JSON:
//!
//! ```json
//! {
//!   "task": "Write the release notes",
//!   "subtasks": [
//!     { "id": 1, "description": "Collect merged changes" },
//!     { "id": 2, "description": "Draft the summary" }
//!   ]
//! }
//! ```
//!
//! Subtasks run one at a time, in file order, through a [`SubtaskHandler`].
//! Entries missing an id or description are skipped and reported, not run.

use std::path::Path;

use sokrates_core::{Subtask, SubtaskEntry, TaskFile};
use tracing::{debug, info, warn};

use crate::executor::{
    ExecutionOutcome, ExecutionSummary, SubtaskDetail, SubtaskStatus, TaskExecutor,
};

/// Everything a handler needs to run one subtask.
#[derive(Debug, Clone, Copy)]
pub struct SubtaskContext<'a> {
    pub subtask: &'a Subtask,
    /// Top-level description of the task file, when it has one.
    pub main_task: Option<&'a str>,
    pub task_file: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubtaskError {
    /// This subtask failed; the rest of the file still runs.
    #[error("{0}")]
    Failed(String),
    /// The handler cannot run anything right now. Aborts the whole attempt as retryable.
    #[error("handler unavailable: {0}")]
    Unavailable(String),
}

/// Executes a single subtask and returns a short completion message.
#[async_trait::async_trait]
pub trait SubtaskHandler: Send + Sync {
    async fn handle(&self, ctx: SubtaskContext<'_>) -> Result<String, SubtaskError>;
}

/// [`TaskExecutor`] that reads a task file and runs its subtasks in order.
#[derive(Debug, Clone)]
pub struct SequentialTaskRunner<H> {
    handler: H,
}

impl<H: SubtaskHandler> SequentialTaskRunner<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait::async_trait]
impl<H: SubtaskHandler> TaskExecutor for SequentialTaskRunner<H> {
    async fn execute(&self, file_path: &Path) -> ExecutionOutcome {
        let raw = match tokio::fs::read_to_string(file_path).await {
            Ok(raw) => raw,
            Err(e) => {
                return ExecutionOutcome::retryable(format!(
                    "failed to read task file {}: {e}",
                    file_path.display()
                ));
            }
        };

        let task_file = match TaskFile::from_json(&raw) {
            Ok(file) => file,
            Err(e) => return ExecutionOutcome::terminal(e.to_string()),
        };

        let entries: Vec<SubtaskEntry> = task_file.entries().collect();
        let mut summary = ExecutionSummary {
            total_tasks: entries.len(),
            ..Default::default()
        };
        info!(file = %file_path.display(), subtasks = entries.len(), "executing task file");

        for entry in entries {
            let subtask = match entry {
                SubtaskEntry::Valid(subtask) => subtask,
                SubtaskEntry::Malformed { id } => {
                    warn!(subtask_id = ?id, "skipping subtask with missing fields");
                    summary.record(SubtaskDetail {
                        subtask_id: id,
                        status: SubtaskStatus::Skipped,
                        message: "Missing required fields".to_string(),
                    });
                    continue;
                }
            };

            let ctx = SubtaskContext {
                subtask: &subtask,
                main_task: task_file.main_task(),
                task_file: file_path,
            };
            match self.handler.handle(ctx).await {
                Ok(message) => {
                    debug!(subtask_id = %subtask.id, "subtask completed");
                    summary.record(SubtaskDetail {
                        subtask_id: Some(subtask.id),
                        status: SubtaskStatus::Completed,
                        message,
                    });
                }
                Err(SubtaskError::Failed(message)) => {
                    warn!(subtask_id = %subtask.id, error = %message, "subtask failed");
                    summary.record(SubtaskDetail {
                        subtask_id: Some(subtask.id),
                        status: SubtaskStatus::Failed,
                        message,
                    });
                }
                Err(SubtaskError::Unavailable(message)) => {
                    return ExecutionOutcome::retryable(format!(
                        "subtask {} could not run: {message}",
                        subtask.id
                    ));
                }
            }
        }

        info!(
            file = %file_path.display(),
            successful = summary.successful_tasks,
            failed = summary.failed_tasks,
            "task file executed"
        );
        ExecutionOutcome::Success(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every subtask it sees; fails ids listed in `fail`.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(String, Option<String>)>>,
        fail: Vec<&'static str>,
        unavailable: bool,
    }

    #[async_trait::async_trait]
    impl SubtaskHandler for RecordingHandler {
        async fn handle(&self, ctx: SubtaskContext<'_>) -> Result<String, SubtaskError> {
            if self.unavailable {
                return Err(SubtaskError::Unavailable("endpoint down".into()));
            }
            self.seen.lock().unwrap().push((
                ctx.subtask.id.clone(),
                ctx.main_task.map(str::to_string),
            ));
            if self.fail.contains(&ctx.subtask.id.as_str()) {
                Err(SubtaskError::Failed(format!("{} broke", ctx.subtask.id)))
            } else {
                Ok(format!("did {}", ctx.subtask.description))
            }
        }
    }

    fn write_task(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("task.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn runs_subtasks_in_order_and_skips_malformed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(
            &dir,
            r#"{
                "task": "main goal",
                "subtasks": [
                    {"id": 1, "description": "first"},
                    {"description": "no id"},
                    {"id": "3", "description": "third"}
                ]
            }"#,
        );
        let runner = SequentialTaskRunner::new(RecordingHandler::default());

        let ExecutionOutcome::Success(summary) = runner.execute(&path).await else {
            panic!("expected success");
        };
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.successful_tasks, 2);
        assert_eq!(summary.failed_tasks, 0);
        assert_eq!(summary.skipped_tasks(), 1);
        assert_eq!(summary.details[1].status, SubtaskStatus::Skipped);
        assert_eq!(summary.details[1].message, "Missing required fields");

        let seen = runner.handler().seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("1".to_string(), Some("main goal".to_string())),
                ("3".to_string(), Some("main goal".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn failed_subtask_does_not_stop_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(
            &dir,
            r#"{"subtasks": [{"id": "a", "description": "x"}, {"id": "b", "description": "y"}]}"#,
        );
        let runner = SequentialTaskRunner::new(RecordingHandler {
            fail: vec!["a"],
            ..Default::default()
        });

        let ExecutionOutcome::Success(summary) = runner.execute(&path).await else {
            panic!("expected success");
        };
        assert_eq!(summary.successful_tasks, 1);
        assert_eq!(summary.failed_tasks, 1);
        assert_eq!(summary.details[0].message, "a broke");
    }

    #[tokio::test]
    async fn unavailable_handler_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(&dir, r#"{"subtasks": [{"id": 1, "description": "x"}]}"#);
        let runner = SequentialTaskRunner::new(RecordingHandler {
            unavailable: true,
            ..Default::default()
        });

        assert!(matches!(
            runner.execute(&path).await,
            ExecutionOutcome::Retryable(msg) if msg.contains("endpoint down")
        ));
    }

    #[tokio::test]
    async fn missing_file_is_retryable_and_bad_json_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SequentialTaskRunner::new(RecordingHandler::default());

        let missing = runner.execute(&dir.path().join("absent.json")).await;
        assert!(matches!(missing, ExecutionOutcome::Retryable(_)));

        let path = write_task(&dir, "{ not json");
        assert!(matches!(
            runner.execute(&path).await,
            ExecutionOutcome::Terminal(_)
        ));
    }

    #[tokio::test]
    async fn odd_entries_are_skipped_rather_than_failing_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(
            &dir,
            r#"{"task": {"goal": "ship"}, "subtasks": ["oops", null, {"id": 2, "description": "real"}]}"#,
        );
        let runner = SequentialTaskRunner::new(RecordingHandler::default());

        let ExecutionOutcome::Success(summary) = runner.execute(&path).await else {
            panic!("expected success");
        };
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.successful_tasks, 1);
        assert_eq!(summary.skipped_tasks(), 2);

        let seen = runner.handler().seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("2".to_string(), Some(r#"{"goal":"ship"}"#.to_string()))]);
    }

    #[tokio::test]
    async fn empty_file_succeeds_with_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(&dir, "{}");
        let runner = SequentialTaskRunner::new(RecordingHandler::default());

        assert_eq!(
            runner.execute(&path).await,
            ExecutionOutcome::Success(ExecutionSummary::default())
        );
    }
}
