//! Retry and dead-letter decisions.
//!
//! A failed attempt is classified as [`ErrorClass::Retryable`] (transient:
//! I/O, timeouts, an unreachable downstream) or [`ErrorClass::Terminal`]
//! (the payload itself is bad). Terminal failures never retry. Retryable ones
//! retry until `max_attempts` is reached and are then dead-lettered.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sokrates_core::{ErrorRecord, TaskId, TaskStatus};
use tracing::{info, warn};

use crate::store::{QueueStore, StoreError};
use crate::tracker::StatusTracker;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Wait, then run another attempt.
    Retry,
    /// Stop; the task stays `failed`.
    Fail,
    /// Stop; the task moves to `dead_letter`.
    DeadLetter,
}

#[derive(Debug, Clone, Default)]
pub struct FailurePolicy {
    retry: RetryPolicy,
}

impl FailurePolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Pure decision for a failed attempt.
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> FailureAction {
        match class {
            ErrorClass::Terminal => FailureAction::Fail,
            ErrorClass::Retryable if self.retry.should_retry(attempt) => FailureAction::Retry,
            ErrorClass::Retryable => FailureAction::DeadLetter,
        }
    }

    pub fn get_retry_delay(&self, attempt: u32) -> Duration {
        self.retry.delay_for_attempt(attempt)
    }

    /// Append a failed attempt to the task's error history.
    pub async fn log_error<S>(
        &self,
        store: &S,
        task_id: TaskId,
        message: &str,
        attempt: u32,
    ) -> Result<ErrorRecord, StoreError>
    where
        S: QueueStore + ?Sized,
    {
        let record = ErrorRecord::new(task_id, message, attempt);
        store.append_error(&record).await?;
        Ok(record)
    }

    /// Decide what to do after a failed attempt and persist any terminal status.
    ///
    /// The task must already be `failed`. `Retry` writes nothing.
    pub async fn handle_failure<S: QueueStore>(
        &self,
        tracker: &StatusTracker<S>,
        task_id: TaskId,
        message: &str,
        attempt: u32,
        class: ErrorClass,
    ) -> Result<FailureAction, StoreError> {
        let action = self.decide(attempt, class);
        match action {
            FailureAction::Retry => {
                info!(%task_id, attempt, max_attempts = self.retry.max_attempts, "task will be retried");
            }
            FailureAction::Fail => {
                warn!(%task_id, attempt, error = message, "task failed permanently");
                tracker
                    .update_status(
                        task_id,
                        TaskStatus::Failed,
                        Some(&format!("Failed permanently: {message}")),
                    )
                    .await?;
            }
            FailureAction::DeadLetter => {
                warn!(%task_id, attempt, error = message, "task moved to dead letter queue");
                tracker
                    .update_status(
                        task_id,
                        TaskStatus::DeadLetter,
                        Some(&format!(
                            "Moved to dead letter queue after {attempt} attempts: {message}"
                        )),
                    )
                    .await?;
            }
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sokrates_core::NewTask;

    use super::*;
    use crate::store::InMemoryQueueStore;

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(5), Duration::from_secs(30));
        let delays: Vec<_> = (1..=5).map(|a| policy.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn linear_and_fixed_delays() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(250));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(5))
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn terminal_errors_never_retry() {
        let policy = FailurePolicy::default();
        assert_eq!(policy.decide(1, ErrorClass::Terminal), FailureAction::Fail);
    }

    #[test]
    fn retryable_errors_dead_letter_at_the_limit() {
        let policy = FailurePolicy::new(RetryPolicy::fixed(3, Duration::ZERO));
        assert_eq!(policy.decide(1, ErrorClass::Retryable), FailureAction::Retry);
        assert_eq!(policy.decide(2, ErrorClass::Retryable), FailureAction::Retry);
        assert_eq!(policy.decide(3, ErrorClass::Retryable), FailureAction::DeadLetter);
    }

    #[test]
    fn no_retry_policy_dead_letters_first_failure() {
        let policy = FailurePolicy::new(RetryPolicy::no_retry());
        assert_eq!(policy.decide(1, ErrorClass::Retryable), FailureAction::DeadLetter);
    }

    #[tokio::test]
    async fn handle_failure_persists_dead_letter() {
        let store = InMemoryQueueStore::arc();
        let tracker = StatusTracker::new(Arc::clone(&store));
        let policy = FailurePolicy::new(RetryPolicy::fixed(1, Duration::ZERO));
        let task = store.enqueue(NewTask::new("/tmp/t.json")).await.unwrap();

        tracker.begin_attempt(task.task_id, 1).await.unwrap();
        tracker
            .update_status(task.task_id, TaskStatus::Failed, Some("timeout"))
            .await
            .unwrap();
        policy
            .log_error(store.as_ref(), task.task_id, "timeout", 1)
            .await
            .unwrap();

        let action = policy
            .handle_failure(&tracker, task.task_id, "timeout", 1, ErrorClass::Retryable)
            .await
            .unwrap();
        assert_eq!(action, FailureAction::DeadLetter);

        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert!(stored.last_error.unwrap().contains("timeout"));
        assert_eq!(store.list_errors(task.task_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handle_failure_retry_leaves_task_failed() {
        let store = InMemoryQueueStore::arc();
        let tracker = StatusTracker::new(Arc::clone(&store));
        let policy = FailurePolicy::default();
        let task = store.enqueue(NewTask::new("/tmp/t.json")).await.unwrap();

        tracker.begin_attempt(task.task_id, 1).await.unwrap();
        tracker
            .update_status(task.task_id, TaskStatus::Failed, Some("reset"))
            .await
            .unwrap();

        let action = policy
            .handle_failure(&tracker, task.task_id, "reset", 1, ErrorClass::Retryable)
            .await
            .unwrap();
        assert_eq!(action, FailureAction::Retry);
        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: delays never shrink as attempts grow and never exceed the cap.
            #[test]
            fn delays_are_monotonic_and_capped(
                base_ms in 0u64..10_000,
                cap_ms in 0u64..600_000,
                attempt in 1u32..64,
            ) {
                let policy = RetryPolicy::exponential(
                    u32::MAX,
                    Duration::from_millis(base_ms),
                    Duration::from_millis(cap_ms),
                );
                let here = policy.delay_for_attempt(attempt);
                let next = policy.delay_for_attempt(attempt + 1);
                prop_assert!(here <= next);
                prop_assert!(next <= Duration::from_millis(cap_ms));
            }

            /// Property: a retryable failure retries iff attempts remain.
            #[test]
            fn retry_decision_tracks_attempt_budget(max in 1u32..20, attempt in 1u32..25) {
                let policy = FailurePolicy::new(RetryPolicy::fixed(max, Duration::ZERO));
                let action = policy.decide(attempt, ErrorClass::Retryable);
                if attempt < max {
                    prop_assert_eq!(action, FailureAction::Retry);
                } else {
                    prop_assert_eq!(action, FailureAction::DeadLetter);
                }
            }
        }
    }
}
