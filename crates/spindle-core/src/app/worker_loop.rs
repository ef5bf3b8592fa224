//! WorkerLoop - claim, handle, report.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{TaskRecord, WorkerTag};
use crate::error::QueueError;
use crate::queue::TaskQueue;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one claimed task. An `Err` is reported as a task failure with the
/// error's message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub lease_lost: u64,
}

/// Drives one worker identity until shutdown.
pub struct WorkerLoop {
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(queue: TaskQueue, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            queue,
            handler,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Idle time between claims when nothing is claimable.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs until `shutdown` turns true or its sender is dropped. The task in
    /// hand is always finished and reported before stopping.
    ///
    /// Lost leases and unreadable documents are logged and skipped; any other
    /// queue error stops the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, QueueError> {
        let worker = self.queue.worker_tag().clone();
        let mut stats = WorkerStats::default();
        info!(worker = %worker, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.queue.claim_one().await {
                Ok(claimed) => claimed,
                Err(e) if e.is_invalid_document() => {
                    warn!(worker = %worker, error = %e, "Skipping unreadable task");
                    continue;
                }
                Err(e) => {
                    error!(worker = %worker, error = %e, "Claim failed");
                    return Err(e);
                }
            };

            let Some(task) = claimed else {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };
            stats.claimed += 1;

            match self.process(&task).await {
                Ok(true) => stats.succeeded += 1,
                Ok(false) => stats.failed += 1,
                Err(e) if e.is_recoverable() => {
                    warn!(worker = %worker, task_id = %task.id, error = %e, "Dropping result");
                    stats.lease_lost += 1;
                }
                Err(e) => {
                    error!(
                        worker = %worker,
                        task_id = %task.id,
                        error = %e,
                        "Reporting outcome failed"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            worker = %worker,
            claimed = stats.claimed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Worker stopped"
        );
        Ok(stats)
    }

    /// Returns whether the handler succeeded.
    async fn process(&self, task: &TaskRecord) -> Result<bool, QueueError> {
        match self.handler.handle(task).await {
            Ok(()) => {
                self.queue.report_success(task).await?;
                Ok(true)
            }
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Handler failed");
                self.queue.report_failure(task, e.to_string()).await?;
                Ok(false)
            }
        }
    }
}

/// A set of workers sharing one shutdown signal.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<Result<WorkerStats, QueueError>>>,
}

impl WorkerGroup {
    /// Spawns one worker per tag over the same queue settings.
    pub fn spawn(
        queue: &TaskQueue,
        tags: impl IntoIterator<Item = WorkerTag>,
        handler: Arc<dyn TaskHandler>,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::new();
        for tag in tags {
            let worker = WorkerLoop::new(queue.for_worker(tag)?, Arc::clone(&handler))
                .poll_interval(poll_interval);
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        Ok(Self { shutdown_tx, joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stops taking new tasks; tasks in hand still complete.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shuts down and waits, summing every worker's stats. The first worker
    /// error is returned after all workers have stopped.
    pub async fn shutdown_and_join(self) -> Result<WorkerStats, QueueError> {
        self.request_shutdown();
        let mut total = WorkerStats::default();
        let mut first_error = None;

        for join in self.joins {
            match join.await {
                Ok(Ok(stats)) => {
                    total.claimed += stats.claimed;
                    total.succeeded += stats.succeeded;
                    total.failed += stats.failed;
                    total.lease_lost += stats.lease_lost;
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::ports::{Filter, Sort, TaskStore};
    use crate::queue::testing::default_harness;
    use serde_json::json;

    /// Fails tasks whose payload is `"bad"`.
    struct PickyHandler;

    #[async_trait]
    impl TaskHandler for PickyHandler {
        async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
            if task.payload == json!("bad") {
                return Err("refused".into());
            }
            Ok(())
        }
    }

    /// Waits until nothing is claimable or held.
    async fn wait_until_idle(queue: &TaskQueue) {
        let claimable = queue.discard_policy().claimable();
        for _ in 0..400 {
            let left = queue.store().count(&claimable).await.unwrap();
            let held = queue.store().count(&Filter::Status(TaskStatus::Pending)).await.unwrap();
            if left == 0 && held == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workers did not drain the queue");
    }

    #[tokio::test]
    async fn worker_reports_success_and_failure() {
        let h = default_harness();
        h.queue.append(json!("good"), 0).await.unwrap();
        h.queue.append(json!("bad"), 0).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(h.queue.clone(), Arc::new(PickyHandler))
            .poll_interval(Duration::from_millis(1));
        let join = tokio::spawn(worker.run(rx));

        wait_until_idle(&h.queue).await;
        tx.send(true).unwrap();
        let stats = join.await.unwrap().unwrap();

        // The bad task keeps failing until it runs out of retries.
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.claimed, 4);

        let failed = h
            .queue
            .find_all(&Filter::Status(TaskStatus::Failed), &Sort::none(), None)
            .await
            .unwrap();
        assert_eq!(failed[0].retries, 3);
        assert_eq!(failed[0].error_message.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn worker_stops_when_the_sender_is_dropped() {
        let h = default_harness();
        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(h.queue.clone(), Arc::new(PickyHandler))
            .poll_interval(Duration::from_secs(60));
        let join = tokio::spawn(worker.run(rx));

        drop(tx);
        let stats = join.await.unwrap().unwrap();
        assert_eq!(stats, WorkerStats::default());
    }

    #[tokio::test]
    async fn group_shares_the_work() {
        let h = default_harness();
        for n in 0..20 {
            h.queue.append(json!(n), 0).await.unwrap();
        }
        h.queue.append(json!("bad"), 0).await.unwrap();

        let tags = (0..4).map(|n| WorkerTag::new(format!("w{n}")));
        let group =
            WorkerGroup::spawn(&h.queue, tags, Arc::new(PickyHandler), Duration::from_millis(1))
                .unwrap();
        assert_eq!(group.len(), 4);

        wait_until_idle(&h.queue).await;
        let stats = group.shutdown_and_join().await.unwrap();
        assert_eq!(stats.succeeded, 20);
        assert_eq!(stats.failed, 3);
    }
}
