//! Claim protocol.

use tracing::{debug, warn};
use ulid::Ulid;

use super::TaskQueue;
use crate::domain::{TaskId, TaskRecord, TaskStatus};
use crate::error::QueueError;
use crate::ports::{Filter, Sort, Update};

/// Tasks handed out by one `claim_many` call, with the counts behind them.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimBatch {
    /// Claimed tasks in queue order; top-ups follow the bulk-claimed ones.
    pub tasks: Vec<TaskRecord>,
    pub requested: usize,
    /// Claimable tasks seen by the selection read.
    pub candidates: usize,
    /// Candidates the bulk update still found claimable.
    pub matched: u64,
    /// Tasks claimed one by one to make up for candidates lost to other workers.
    pub topped_up: usize,
}

impl ClaimBatch {
    fn empty(requested: usize) -> Self {
        Self {
            tasks: Vec::new(),
            requested,
            candidates: 0,
            matched: 0,
            topped_up: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The bulk update lost candidates to concurrent claimers.
    pub fn raced(&self) -> bool {
        self.matched < self.candidates as u64
    }

    /// `PartialBatchFailure` when fewer tasks than candidates were obtained.
    /// The claimed tasks stay in the batch either way.
    pub fn shortfall(&self) -> Option<QueueError> {
        (self.tasks.len() < self.candidates).then(|| QueueError::PartialBatchFailure {
            operation: "claim_many",
            requested: self.candidates,
            affected: self.tasks.len(),
        })
    }

    pub fn into_tasks(self) -> Vec<TaskRecord> {
        self.tasks
    }
}

impl TaskQueue {
    fn claim_update(&self, token: Option<String>) -> Update {
        Update::new()
            .assign(self.worker_tag())
            .status(TaskStatus::Pending)
            .claim_token(token)
            .touch(self.now())
    }

    /// Atomically claims the front claimable task for this worker.
    ///
    /// Returns `None` when nothing is claimable. Two racing workers never get
    /// the same task.
    pub async fn claim_one(&self) -> Result<Option<TaskRecord>, QueueError> {
        let claimed = self
            .store
            .find_one_and_update(
                &self.discard_policy().claimable(),
                &self.claim_update(None),
                &Sort::queue_order(),
            )
            .await?;

        let worker = self.worker_tag();
        match &claimed {
            Some(task) => {
                debug!(task_id = %task.id, %worker, priority = task.priority, "Claimed task")
            }
            None => debug!(%worker, "No claimable task"),
        }
        Ok(claimed)
    }

    /// Claims up to `count` tasks.
    ///
    /// Selects candidates in queue order, then claims them with one bulk update
    /// that re-checks the claimable predicate, so a candidate another worker
    /// took in between is skipped rather than stolen. The bulk update stamps a
    /// fresh claim token, and the read-back selects on it, so a single claim
    /// made under the same worker tag in between is never handed out twice.
    /// Candidates lost to the race are replaced through `claim_one`.
    pub async fn claim_many(&self, count: usize) -> Result<ClaimBatch, QueueError> {
        if count == 0 {
            return Ok(ClaimBatch::empty(0));
        }

        let claimable = self.discard_policy().claimable();
        let candidates: Vec<TaskId> = self
            .store
            .find(&claimable, &Sort::queue_order(), Some(count))
            .await?
            .collect_valid()
            .await?
            .into_iter()
            .map(|task| task.id)
            .collect();

        if candidates.is_empty() {
            debug!(worker = %self.worker_tag(), requested = count, "No claimable tasks");
            return Ok(ClaimBatch::empty(count));
        }

        let token = Ulid::new().to_string();
        let out = self
            .store
            .update_many(
                &Filter::and([Filter::IdIn(candidates.clone()), claimable]),
                &self.claim_update(Some(token.clone())),
            )
            .await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected { operation: "claim_many" });
        }

        let mut tasks = self
            .store
            .find(
                &Filter::and([
                    Filter::IdIn(candidates.clone()),
                    Filter::assigned_to(self.worker_tag()),
                    Filter::Status(TaskStatus::Pending),
                    Filter::ClaimToken(token),
                ]),
                &Sort::queue_order(),
                None,
            )
            .await?
            .collect_valid()
            .await?;

        let mut batch = ClaimBatch {
            tasks: Vec::new(),
            requested: count,
            candidates: candidates.len(),
            matched: out.matched,
            topped_up: 0,
        };

        if batch.raced() {
            warn!(
                worker = %self.worker_tag(),
                candidates = batch.candidates,
                matched = batch.matched,
                "Bulk claim matched fewer tasks than selected; topping up"
            );
        }

        while tasks.len() < candidates.len() {
            match self.claim_one().await? {
                Some(task) => {
                    tasks.push(task);
                    batch.topped_up += 1;
                }
                None => break,
            }
        }

        batch.tasks = tasks;
        if let Some(shortfall) = batch.shortfall() {
            warn!(worker = %self.worker_tag(), error = %shortfall, "Claim batch came up short");
        }
        debug!(
            worker = %self.worker_tag(),
            claimed = batch.len(),
            requested = count,
            "Claimed batch"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::WorkerTag;
    use crate::queue::QueueConfig;
    use crate::queue::testing::{default_harness, harness};
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn claims_follow_priority_then_creation_order() {
        let h = default_harness();
        let a = h.queue.append(json!("A"), 5).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        let b = h.queue.append(json!("B"), 5).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        let c = h.queue.append(json!("C"), 1).await.unwrap();

        let mut order = Vec::new();
        while let Some(task) = h.queue.claim_one().await.unwrap() {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.assigned_to.as_deref(), Some("w1"));
            order.push(task.id);
        }
        assert_eq!(order, vec![a, b, c]);
    }

    #[tokio::test]
    async fn claim_on_empty_queue_is_none() {
        let h = default_harness();
        assert!(h.queue.claim_one().await.unwrap().is_none());
        assert!(h.queue.claim_many(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_task() {
        let h = default_harness();
        h.queue.append(json!("only"), 0).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..16 {
            let queue = h.queue.for_worker(WorkerTag::new(format!("w{n}"))).unwrap();
            handles.push(tokio::spawn(async move { queue.claim_one().await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_split_the_queue() {
        let h = default_harness();
        for n in 0..50 {
            h.queue.append(json!(n), 0).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let queue = h.queue.for_worker(WorkerTag::new(format!("w{n}"))).unwrap();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = queue.claim_one().await.unwrap() {
                    mine.push(task.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn claim_many_takes_the_front_of_the_queue() {
        let h = default_harness();
        for p in [1, 9, 5, 7] {
            h.queue.append(json!(p), p).await.unwrap();
        }

        let batch = h.queue.claim_many(3).await.unwrap();
        let priorities: Vec<_> = batch.tasks.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, [9, 7, 5]);
        assert_eq!(batch.candidates, 3);
        assert_eq!(batch.matched, 3);
        assert_eq!(batch.topped_up, 0);
        assert!(!batch.raced());
        assert!(batch.shortfall().is_none());
    }

    #[tokio::test]
    async fn claim_many_with_fewer_tasks_than_requested() {
        let h = default_harness();
        h.queue.append(json!(1), 0).await.unwrap();

        let batch = h.queue.claim_many(5).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.requested, 5);
        assert_eq!(batch.candidates, 1);
        assert!(batch.shortfall().is_none());
    }

    /// A store that lets another worker claim the first candidate between the
    /// selection read and the bulk update.
    mod racing {
        use async_trait::async_trait;

        use crate::domain::{TaskDraft, TaskRecord, TaskStatus, WorkerTag};
        use crate::error::StoreError;
        use crate::impls::InMemoryTaskStore;
        use crate::ports::{
            DeleteOutcome, Field, Filter, InsertManyOutcome, InsertOutcome, Sort, SortOrder,
            TaskCursor, TaskStore, Update, UpdateOutcome,
        };

        pub struct RacingStore {
            pub inner: InMemoryTaskStore,
            /// Tag the interfering claim is made under.
            pub rival: WorkerTag,
        }

        #[async_trait]
        impl TaskStore for RacingStore {
            async fn find_one_and_update(
                &self,
                filter: &Filter,
                update: &Update,
                sort: &Sort,
            ) -> Result<Option<TaskRecord>, StoreError> {
                self.inner.find_one_and_update(filter, update, sort).await
            }
            async fn find_one_and_delete(
                &self,
                filter: &Filter,
                sort: &Sort,
            ) -> Result<Option<TaskRecord>, StoreError> {
                self.inner.find_one_and_delete(filter, sort).await
            }
            async fn update_many(
                &self,
                filter: &Filter,
                update: &Update,
            ) -> Result<UpdateOutcome, StoreError> {
                if let Filter::And(parts) = filter
                    && let Some(Filter::IdIn(ids)) = parts.first()
                {
                    let rival = Update::new()
                        .assign(&self.rival)
                        .status(TaskStatus::Pending);
                    self.inner
                        .find_one_and_update(&Filter::Id(ids[0].clone()), &rival, &Sort::none())
                        .await?;
                }
                self.inner.update_many(filter, update).await
            }
            async fn replace_one(
                &self,
                filter: &Filter,
                record: &TaskRecord,
                upsert: bool,
            ) -> Result<UpdateOutcome, StoreError> {
                self.inner.replace_one(filter, record, upsert).await
            }
            async fn delete_many(&self, filter: &Filter) -> Result<DeleteOutcome, StoreError> {
                self.inner.delete_many(filter).await
            }
            async fn insert_one(
                &self,
                draft: TaskDraft,
                now: f64,
            ) -> Result<InsertOutcome, StoreError> {
                self.inner.insert_one(draft, now).await
            }
            async fn insert_many(
                &self,
                drafts: Vec<TaskDraft>,
                now: f64,
                ordered: bool,
            ) -> Result<InsertManyOutcome, StoreError> {
                self.inner.insert_many(drafts, now, ordered).await
            }
            async fn find(
                &self,
                filter: &Filter,
                sort: &Sort,
                limit: Option<usize>,
            ) -> Result<TaskCursor, StoreError> {
                self.inner.find(filter, sort, limit).await
            }
            async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
                self.inner.count(filter).await
            }
            async fn create_index(
                &self,
                keys: &[(Field, SortOrder)],
                background: bool,
            ) -> Result<String, StoreError> {
                self.inner.create_index(keys, background).await
            }
        }
    }

    async fn racing_queue(rival: &str) -> crate::queue::TaskQueue {
        let store = Arc::new(racing::RacingStore {
            inner: crate::impls::InMemoryTaskStore::new(),
            rival: WorkerTag::new(rival),
        });
        let queue = crate::queue::TaskQueue::new(
            store,
            QueueConfig::builder().worker_tag(WorkerTag::new("w1")).build().unwrap(),
        );
        for p in [3, 2, 1] {
            queue.append(json!(p), p).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn claim_many_tops_up_candidates_lost_to_a_race() {
        let queue = racing_queue("rival").await;

        let batch = queue.claim_many(2).await.unwrap();
        assert_eq!(batch.candidates, 2);
        assert_eq!(batch.matched, 1);
        assert!(batch.raced());
        assert_eq!(batch.topped_up, 1);

        let priorities: Vec<_> = batch.tasks.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, [2, 1]);
        assert!(batch.tasks.iter().all(|t| t.assigned_to.as_deref() == Some("w1")));
        assert!(batch.shortfall().is_none());
    }

    #[tokio::test]
    async fn claim_many_leaves_out_a_same_tag_claim_made_mid_batch() {
        // The interfering claim runs under this queue's own tag, as a clone of
        // the queue would.
        let queue = racing_queue("w1").await;

        let batch = queue.claim_many(2).await.unwrap();
        assert_eq!(batch.matched, 1);
        assert_eq!(batch.topped_up, 1);
        let priorities: Vec<_> = batch.tasks.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, [2, 1]);

        // The front task went to the other claim and only to it.
        let front = queue
            .find_all(&Filter::Status(TaskStatus::Pending), &Sort::queue_order(), Some(1))
            .await
            .unwrap();
        assert_eq!(front[0].priority, 3);
        assert!(batch.tasks.iter().all(|t| t.id != front[0].id));
    }

    #[tokio::test]
    async fn claim_skips_exhausted_tasks() {
        let h = harness(QueueConfig::builder().max_retries(1).build().unwrap());
        h.queue.append(json!(1), 0).await.unwrap();
        let task = h.queue.claim_one().await.unwrap().unwrap();
        h.queue.report_failure(&task, "boom").await.unwrap();
        assert!(h.queue.claim_one().await.unwrap().is_none());
    }
}
