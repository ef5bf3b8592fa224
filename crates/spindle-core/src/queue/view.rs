//! Read-only listings and operator deletes.
//!
//! None of these take part in the lifecycle; they read (or bulk delete)
//! through the same `TaskRecord` shape.

use tracing::{info, warn};

use super::TaskQueue;
use crate::domain::{TaskRecord, TaskStatus};
use crate::error::QueueError;
use crate::observability::StatusCounts;
use crate::ports::{Filter, Sort, TaskCursor};

impl TaskQueue {
    /// The `n` tasks at the front of the queue, front first.
    pub async fn head(&self, n: usize) -> Result<Vec<TaskRecord>, QueueError> {
        self.find_all(&Filter::All, &Sort::queue_order(), Some(n)).await
    }

    /// The `n` tasks at the back of the queue, oldest of them first.
    pub async fn tail(&self, n: usize) -> Result<Vec<TaskRecord>, QueueError> {
        let mut tasks = self.find_all(&Filter::All, &Sort::reverse_queue_order(), Some(n)).await?;
        tasks.reverse();
        Ok(tasks)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let mut counts = StatusCounts {
            total: self.store.count(&Filter::All).await?,
            ..StatusCounts::default()
        };
        for status in TaskStatus::ALL {
            counts.set(status, self.store.count(&Filter::Status(status)).await?);
        }
        if counts.unreadable() > 0 {
            warn!(
                unreadable = counts.unreadable(),
                "Collection holds documents without a valid status"
            );
        }
        Ok(counts)
    }

    /// Raw query access. The cursor runs the query once and is not restartable.
    pub async fn find(
        &self,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> Result<TaskCursor, QueueError> {
        Ok(self.store.find(filter, sort, limit).await?)
    }

    /// `find`, collected. Undecodable documents are logged and skipped.
    pub async fn find_all(
        &self,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        Ok(self.find(filter, sort, limit).await?.collect_valid().await?)
    }

    /// Deletes the given tasks by id. Returns how many were deleted.
    pub async fn delete_tasks(&self, tasks: &[TaskRecord]) -> Result<u64, QueueError> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let ids = tasks.iter().map(|t| t.id.clone()).collect();
        let out = self.store.delete_many(&Filter::IdIn(ids)).await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected {
                operation: "delete_tasks",
            });
        }
        Ok(out.deleted)
    }

    /// Deletes every task document. Destructive; for operators and tests.
    pub async fn clear(&self) -> Result<u64, QueueError> {
        let out = self
            .store
            .delete_many(&Filter::StatusIn(TaskStatus::ALL.to_vec()))
            .await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected { operation: "clear" });
        }
        info!(deleted = out.deleted, "Cleared task queue");
        Ok(out.deleted)
    }
}
