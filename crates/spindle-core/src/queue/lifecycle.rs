//! Worker-reported outcomes.

use tracing::{debug, warn};

use super::TaskQueue;
use crate::domain::{TaskRecord, TaskStatus};
use crate::error::QueueError;
use crate::ports::{Filter, Sort, Update};

impl TaskQueue {
    /// Pending -> Successful. Returns the record as stored.
    ///
    /// Like every worker report, this only applies while this worker still
    /// holds the task; otherwise the result is `LeaseLost`.
    pub async fn report_success(&self, task: &TaskRecord) -> Result<TaskRecord, QueueError> {
        let now = self.now();
        let update = Update::new()
            .unassign()
            .status(TaskStatus::Successful)
            .touch(now);
        let mut fallback = task.clone();
        fallback.mark_succeeded(now);

        let record = self.settle(task, &update, fallback, "report_success").await?;
        debug!(task_id = %record.id, "Task succeeded");
        Ok(record)
    }

    /// Pending -> Failed, counting one retry.
    pub async fn report_failure(
        &self,
        task: &TaskRecord,
        error_message: impl Into<String>,
    ) -> Result<TaskRecord, QueueError> {
        let now = self.now();
        let error_message = error_message.into();
        let update = Update::new()
            .unassign()
            .status(TaskStatus::Failed)
            .error_message(Some(error_message.clone()))
            .inc_retries()
            .touch(now);
        let mut fallback = task.clone();
        fallback.mark_failed(Some(error_message), now);

        let record = self.settle(task, &update, fallback, "report_failure").await?;
        debug!(task_id = %record.id, retries = record.retries, "Task failed");
        Ok(record)
    }

    /// Hands a claimed task back to the pool as NEW, counting one retry.
    ///
    /// Only succeeds while this worker still holds the task. If the lease
    /// expired and the task moved on, the result is `LeaseLost` and the caller
    /// should drop whatever it computed.
    pub async fn release_for_retry(&self, task: &TaskRecord) -> Result<TaskRecord, QueueError> {
        let update = Update::new()
            .unassign()
            .status(TaskStatus::New)
            .inc_retries()
            .touch(self.now());
        match self.update_held(task, &update).await? {
            Some(record) => {
                debug!(task_id = %record.id, retries = record.retries, "Task released for retry");
                Ok(record)
            }
            None => Err(self.lease_lost(task, "release_for_retry")),
        }
    }

    async fn update_held(
        &self,
        task: &TaskRecord,
        update: &Update,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let held = Filter::and([
            Filter::Id(task.id.clone()),
            Filter::assigned_to(self.worker_tag()),
        ]);
        Ok(self.store.find_one_and_update(&held, update, &Sort::none()).await?)
    }

    fn lease_lost(&self, task: &TaskRecord, operation: &'static str) -> QueueError {
        warn!(task_id = %task.id, worker = %self.worker_tag(), operation, "Lease lost");
        QueueError::LeaseLost {
            task_id: task.id.clone(),
            worker: self.worker_tag().to_string(),
        }
    }

    /// Applies `update` while the lease is held. A document that still exists
    /// under another claim (or none) is a lost lease; a document that is gone
    /// is re-inserted as `fallback`.
    async fn settle(
        &self,
        task: &TaskRecord,
        update: &Update,
        fallback: TaskRecord,
        operation: &'static str,
    ) -> Result<TaskRecord, QueueError> {
        if let Some(record) = self.update_held(task, update).await? {
            return Ok(record);
        }
        if self.store.count(&Filter::Id(task.id.clone())).await? > 0 {
            return Err(self.lease_lost(task, operation));
        }

        let out = self
            .store
            .replace_one(&Filter::Id(fallback.id.clone()), &fallback, true)
            .await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected { operation });
        }
        if let Some(id) = &out.upserted {
            warn!(task_id = %id, operation, "Task document was missing and has been re-inserted");
        }
        Ok(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskEvent, WorkerTag};
    use crate::ports::TaskStore;
    use crate::queue::QueueConfig;
    use crate::queue::testing::{Harness, default_harness, harness};
    use chrono::Duration;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    #[tokio::test]
    async fn success_releases_the_task_and_stamps_it() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();

        h.clock.advance(Duration::seconds(3));
        let done = h.queue.report_success(&task).await.unwrap();
        assert_eq!(done.status, TaskStatus::Successful);
        assert_eq!(done.assigned_to, None);
        assert_eq!(done.modified_at, task.modified_at + 3.0);
        assert_eq!(done.retries, 0);

        let stored = h
            .queue
            .find_all(&Filter::Id(task.id.clone()), &Sort::none(), None)
            .await
            .unwrap();
        assert_eq!(stored, vec![done]);
    }

    #[tokio::test]
    async fn failure_counts_a_retry_and_keeps_the_message() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();

        let failed = h.queue.report_failure(&task, "timeout").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retries, 1);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));

        // Failed with retries left is claimable again.
        let again = h.queue.claim_one().await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.retries, 1);
    }

    #[tokio::test]
    async fn reporting_a_deleted_task_reinserts_it() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();
        h.queue.delete_tasks(std::slice::from_ref(&task)).await.unwrap();

        h.queue.report_success(&task).await.unwrap();
        assert_eq!(h.queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unacknowledged_reinsert_is_write_rejected() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();
        h.queue.delete_tasks(std::slice::from_ref(&task)).await.unwrap();

        h.store.set_acknowledge_writes(false).await;
        let err = h.queue.report_success(&task).await.unwrap_err();
        assert!(matches!(err, QueueError::WriteRejected { operation: "report_success" }));
    }

    /// w1 claims, its lease expires, w2 fails the task once and claims it
    /// again. Returns w1's stale copy.
    async fn reclaimed_elsewhere(h: &Harness) -> TaskRecord {
        h.queue.append(json!(1), 0).await.unwrap();
        let stale = h.queue.claim_one().await.unwrap().unwrap();

        h.clock.advance(Duration::seconds(11));
        assert_eq!(h.queue.sweep_expired(false).await.unwrap(), 1);

        let w2 = h.queue.for_worker(WorkerTag::new("w2")).unwrap();
        let task = w2.claim_one().await.unwrap().unwrap();
        w2.report_failure(&task, "flaky").await.unwrap();
        let live = w2.claim_one().await.unwrap().unwrap();
        assert_eq!(live.retries, 2);
        stale
    }

    #[rstest]
    #[case::success(true)]
    #[case::failure(false)]
    #[tokio::test]
    async fn stale_report_after_reclaim_is_lease_lost(#[case] succeeded: bool) {
        let h = harness(QueueConfig::builder().ttl(10).build().unwrap());
        let stale = reclaimed_elsewhere(&h).await;

        let err = if succeeded {
            h.queue.report_success(&stale).await.unwrap_err()
        } else {
            h.queue.report_failure(&stale, "late").await.unwrap_err()
        };
        assert!(matches!(err, QueueError::LeaseLost { ref worker, .. } if worker == "w1"));

        let stored = h
            .queue
            .find_all(&Filter::Id(stale.id.clone()), &Sort::none(), None)
            .await
            .unwrap();
        assert_eq!(stored[0].status, TaskStatus::Pending);
        assert_eq!(stored[0].assigned_to.as_deref(), Some("w2"));
        assert_eq!(stored[0].retries, 2);
    }

    #[tokio::test]
    async fn report_for_a_task_never_claimed_is_lease_lost() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let unclaimed = h.queue.head(1).await.unwrap().remove(0);

        let err = h.queue.report_failure(&unclaimed, "x").await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(h.queue.status_counts().await.unwrap().new, 1);
    }

    #[tokio::test]
    async fn release_returns_the_task_to_the_pool() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();

        let released = h.queue.release_for_retry(&task).await.unwrap();
        assert_eq!(released.status, TaskStatus::New);
        assert_eq!(released.assigned_to, None);
        assert_eq!(released.retries, 1);
        assert!(released.modified_at >= released.created_at);

        assert!(h.queue.claim_one().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_after_reassignment_is_lease_lost() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();

        // Another worker took the task over.
        h.store
            .update_many(&Filter::Id(task.id.clone()), &Update::new().assign(&WorkerTag::new("w9")))
            .await
            .unwrap();

        let err = h.queue.release_for_retry(&task).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, QueueError::LeaseLost { ref worker, .. } if worker == "w1"));

        let stored = h
            .queue
            .find_all(&Filter::Id(task.id.clone()), &Sort::none(), None)
            .await
            .unwrap();
        assert_eq!(stored[0].retries, 0);
        assert_eq!(stored[0].assigned_to.as_deref(), Some("w9"));
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fail,
        Expire,
        Release,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![Just(Step::Fail), Just(Step::Expire), Just(Step::Release)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn retries_increase_by_one_per_event(steps in prop::collection::vec(step(), 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let h = crate::queue::testing::harness(
                    crate::queue::QueueConfig::builder().ttl(10).max_retries(1000).build().unwrap(),
                );
                h.queue.append(json!("p"), 0).await.unwrap();
                let mut retries = 0;

                for step in steps {
                    let task = h.queue.claim_one().await.unwrap().unwrap();
                    assert_eq!(task.status.on(TaskEvent::Claim), None);

                    let after = match step {
                        Step::Fail => h.queue.report_failure(&task, "x").await.unwrap().retries,
                        Step::Release => h.queue.release_for_retry(&task).await.unwrap().retries,
                        Step::Expire => {
                            h.clock.advance(Duration::seconds(11));
                            assert_eq!(h.queue.sweep_expired(false).await.unwrap(), 1);
                            h.queue
                                .find_all(&Filter::Id(task.id.clone()), &Sort::none(), None)
                                .await
                                .unwrap()[0]
                                .retries
                        }
                    };
                    assert_eq!(after, retries + 1);
                    retries = after;
                }
            });
        }
    }
}
