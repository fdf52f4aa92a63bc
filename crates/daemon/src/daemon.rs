//! The polling loop.
//!
//! One pass, then sleep for the processing interval, forever. A failed pass is
//! logged and the loop carries on. A shutdown signal ends the loop at once,
//! mid-pass included; the task being executed stays `in_progress` and is not
//! reconciled.

use std::future::Future;
use std::time::Duration;

use sokrates_queue::{PassReport, Processor, QueueStore, TaskExecutor};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    Started,
    Stopped,
}

pub struct Daemon<S, E> {
    processor: Processor<S, E>,
    interval: Duration,
    batch_limit: Option<usize>,
    state: DaemonState,
    iterations: u64,
}

impl<S: QueueStore, E: TaskExecutor> Daemon<S, E> {
    pub fn new(processor: Processor<S, E>, interval: Duration, batch_limit: Option<usize>) -> Self {
        Self {
            processor,
            interval,
            batch_limit,
            state: DaemonState::Created,
            iterations: 0,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Passes attempted so far, failed ones included.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn processor(&self) -> &Processor<S, E> {
        &self.processor
    }

    /// Run until SIGTERM or SIGINT, either of which ends the current pass too.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;

        self.run_until(async move {
            let name = tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
            };
            info!(signal = name, "shutdown requested");
        })
        .await;
        Ok(())
    }

    /// Run the loop until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.state = DaemonState::Started;
        info!(
            interval_secs = self.interval.as_secs_f64(),
            batch_limit = ?self.batch_limit,
            "task queue daemon started"
        );

        loop {
            let interrupted = tokio::select! {
                biased;
                _ = &mut shutdown => true,
                _ = self.run_once() => false,
            };
            if interrupted {
                warn!(
                    iteration = self.iterations,
                    "shutdown during a pass; current task left in progress"
                );
                self.processor.store().close().await;
                break;
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.state = DaemonState::Stopped;
        info!(iterations = self.iterations, "task queue daemon stopped");
    }

    /// One iteration. Errors are logged, never propagated.
    pub async fn run_once(&mut self) -> Option<PassReport> {
        self.iterations += 1;
        match self.processor.process_tasks(self.batch_limit).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(iteration = self.iterations, error = %e, "processing pass failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use sokrates_core::{NewTask, TaskStatus};
    use sokrates_queue::{
        ExecutionOutcome, ExecutionSummary, InMemoryQueueStore, ProcessorConfig, RetryPolicy,
    };

    use super::*;

    struct Succeeds;

    #[async_trait::async_trait]
    impl TaskExecutor for Succeeds {
        async fn execute(&self, _file_path: &Path) -> ExecutionOutcome {
            ExecutionOutcome::Success(ExecutionSummary::default())
        }
    }

    fn daemon(store: Arc<InMemoryQueueStore>) -> Daemon<Arc<InMemoryQueueStore>, Succeeds> {
        let config = ProcessorConfig {
            retry_policy: RetryPolicy::no_retry(),
            inter_task_delay: Duration::ZERO,
        };
        Daemon::new(
            Processor::new(store, Succeeds, config),
            Duration::from_millis(5),
            None,
        )
    }

    #[tokio::test]
    async fn failed_pass_does_not_stop_the_loop() {
        let store = InMemoryQueueStore::arc();
        store.set_available(false);
        let mut daemon = daemon(Arc::clone(&store));
        assert_eq!(daemon.state(), DaemonState::Created);

        daemon
            .run_until(tokio::time::sleep(Duration::from_millis(60)))
            .await;

        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(daemon.iterations() >= 2, "ran {} passes", daemon.iterations());
        assert!(store.close_count() as u64 >= daemon.iterations());
    }

    #[tokio::test]
    async fn later_pass_recovers_after_storage_outage() {
        let store = InMemoryQueueStore::arc();
        let task = store.enqueue(NewTask::new("/tmp/a.json")).await.unwrap();
        let mut daemon = daemon(Arc::clone(&store));

        store.set_available(false);
        assert!(daemon.run_once().await.is_none());

        store.set_available(true);
        let report = daemon.run_once().await.unwrap();
        assert_eq!(report.processed(), 1);

        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_is_observed_between_passes() {
        let store = InMemoryQueueStore::arc();
        let mut daemon = daemon(store);

        daemon
            .run_until(tokio::time::sleep(Duration::from_millis(2)))
            .await;

        assert!(daemon.iterations() >= 1);
        assert_eq!(daemon.state(), DaemonState::Stopped);
    }

    struct Slow;

    #[async_trait::async_trait]
    impl TaskExecutor for Slow {
        async fn execute(&self, _file_path: &Path) -> ExecutionOutcome {
            tokio::time::sleep(Duration::from_millis(300)).await;
            ExecutionOutcome::Success(ExecutionSummary::default())
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_running_pass() {
        let store = InMemoryQueueStore::arc();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let task = store
                .enqueue(NewTask::new(format!("/tmp/{name}.json")))
                .await
                .unwrap();
            ids.push(task.task_id);
        }
        let config = ProcessorConfig {
            retry_policy: RetryPolicy::no_retry(),
            inter_task_delay: Duration::ZERO,
        };
        let mut daemon = Daemon::new(
            Processor::new(Arc::clone(&store), Slow, config),
            Duration::from_secs(60),
            None,
        );

        let started = std::time::Instant::now();
        daemon
            .run_until(tokio::time::sleep(Duration::from_millis(10)))
            .await;

        assert!(started.elapsed() < Duration::from_millis(250), "took {:?}", started.elapsed());
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert_eq!(store.close_count(), 1);

        let first = store.get_task(ids[0]).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::InProgress);
        for id in &ids[1..] {
            let task = store.get_task(*id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
        }
    }
}
