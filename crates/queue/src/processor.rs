//! One processing pass over the queue.
//!
//! A pass fetches the pending tasks, runs each one through the executor with
//! retries, and closes the store before returning. Tasks are independent: a
//! failing task never stops the pass. Storage errors do, since the queue's
//! state can no longer be trusted. A task whose status write failed may be left
//! `in_progress`; it is named in the log and in [`ProcessError::stranded_task`].

use std::time::Duration;

use serde::Serialize;
use sokrates_core::{Task, TaskId, TaskStatus};
use tracing::{error, info, instrument, warn};

use crate::executor::{ExecutionOutcome, ExecutionSummary, TaskExecutor};
use crate::policy::{ErrorClass, FailureAction, FailurePolicy, RetryPolicy};
use crate::store::{QueueStore, StoreError};
use crate::tracker::StatusTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub retry_policy: RetryPolicy,
    /// Pause between consecutive tasks in a pass.
    pub inter_task_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            inter_task_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to fetch pending tasks: {0}")]
    Fetch(#[source] StoreError),
    #[error("storage error while processing task {task_id}: {source}")]
    Storage {
        task_id: TaskId,
        #[source]
        source: StoreError,
    },
}

impl ProcessError {
    /// The task that may be stuck `in_progress` because the pass aborted mid-task.
    pub fn stranded_task(&self) -> Option<TaskId> {
        match self {
            Self::Fetch(_) => None,
            Self::Storage { task_id, .. } => Some(*task_id),
        }
    }
}

/// How one task ended within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Delay slept before each retry, in order.
    pub backoff_delays: Vec<Duration>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl PassReport {
    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Drives pending tasks through execution, retry and terminal status.
pub struct Processor<S, E> {
    tracker: StatusTracker<S>,
    policy: FailurePolicy,
    executor: E,
    inter_task_delay: Duration,
}

impl<S: QueueStore, E: TaskExecutor> Processor<S, E> {
    pub fn new(store: S, executor: E, config: ProcessorConfig) -> Self {
        Self {
            tracker: StatusTracker::new(store),
            policy: FailurePolicy::new(config.retry_policy),
            executor,
            inter_task_delay: config.inter_task_delay,
        }
    }

    pub fn store(&self) -> &S {
        self.tracker.store()
    }

    /// Run one pass over up to `limit` pending tasks (`None` = all).
    ///
    /// The store is closed before this returns, whether or not the pass succeeded.
    pub async fn process_tasks(&self, limit: Option<usize>) -> Result<PassReport, ProcessError> {
        let result = self.run_pass(limit).await;
        self.tracker.store().close().await;
        if let Err(e) = &result {
            error!(error = %e, "processing pass aborted");
        }
        result
    }

    async fn run_pass(&self, limit: Option<usize>) -> Result<PassReport, ProcessError> {
        let pending = self
            .tracker
            .store()
            .get_pending_tasks(limit)
            .await
            .map_err(ProcessError::Fetch)?;

        if pending.is_empty() {
            info!("no pending tasks");
            return Ok(PassReport::default());
        }
        info!(count = pending.len(), "processing pending tasks");

        let mut report = PassReport::default();
        for (index, task) in pending.iter().enumerate() {
            if index > 0 && !self.inter_task_delay.is_zero() {
                tokio::time::sleep(self.inter_task_delay).await;
            }
            let outcome = match self.process_task(task).await {
                Ok(outcome) => outcome,
                Err(source) => {
                    warn!(
                        task_id = %task.task_id,
                        untouched = pending.len() - index - 1,
                        "pass aborted mid-task; task may be left in_progress"
                    );
                    return Err(ProcessError::Storage {
                        task_id: task.task_id,
                        source,
                    });
                }
            };
            report.outcomes.push(outcome);
        }

        info!(
            processed = report.processed(),
            completed = report.count(TaskStatus::Completed),
            failed = report.count(TaskStatus::Failed),
            dead_letter = report.count(TaskStatus::DeadLetter),
            "processing pass finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id, file = %task.file_path.display()))]
    async fn process_task(&self, task: &Task) -> Result<TaskOutcome, StoreError> {
        let task_id = task.task_id;
        let mut attempt = 1;
        let mut backoff_delays = Vec::new();

        self.tracker.begin_attempt(task_id, attempt).await?;
        loop {
            let (message, class) = match self.executor.execute(&task.file_path).await {
                ExecutionOutcome::Success(summary) => {
                    let message = completion_message(&summary, attempt);
                    self.tracker
                        .update_status(task_id, TaskStatus::Completed, Some(&message))
                        .await?;
                    info!(attempt, "task completed");
                    return Ok(TaskOutcome {
                        task_id,
                        status: TaskStatus::Completed,
                        attempts: attempt,
                        backoff_delays,
                        message,
                    });
                }
                ExecutionOutcome::Retryable(message) => (message, ErrorClass::Retryable),
                ExecutionOutcome::Terminal(message) => (message, ErrorClass::Terminal),
            };

            warn!(attempt, error = %message, class = ?class, "task attempt failed");
            self.tracker
                .update_status(task_id, TaskStatus::Failed, Some(&message))
                .await?;
            self.policy
                .log_error(self.tracker.store(), task_id, &message, attempt)
                .await?;

            let action = self
                .policy
                .handle_failure(&self.tracker, task_id, &message, attempt, class)
                .await?;
            let status = match action {
                FailureAction::Retry => {
                    let delay = self.policy.get_retry_delay(attempt);
                    info!(attempt, delay_ms = delay.as_millis() as u64, "retrying task");
                    tokio::time::sleep(delay).await;
                    backoff_delays.push(delay);
                    attempt += 1;
                    self.tracker.begin_attempt(task_id, attempt).await?;
                    continue;
                }
                FailureAction::Fail => TaskStatus::Failed,
                FailureAction::DeadLetter => TaskStatus::DeadLetter,
            };

            return Ok(TaskOutcome {
                task_id,
                status,
                attempts: attempt,
                backoff_delays,
                message,
            });
        }
    }
}

fn completion_message(summary: &ExecutionSummary, attempt: u32) -> String {
    let counts = format!(
        "{}/{} tasks",
        summary.successful_tasks, summary.total_tasks
    );
    if attempt > 1 {
        format!("Successfully executed on retry {}: {counts}", attempt - 1)
    } else {
        format!("Successfully executed: {counts}")
    }
}
