//! Producing tasks and draining completed ones.

use serde_json::Value;
use tracing::{debug, warn};

use super::TaskQueue;
use crate::domain::{TaskDraft, TaskId, TaskRecord, TaskStatus};
use crate::error::QueueError;
use crate::ports::{Filter, InsertFailure, Sort};

/// Outcome of a bulk append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertReport {
    pub requested: usize,
    pub inserted_ids: Vec<TaskId>,
    pub failures: Vec<InsertFailure>,
}

impl InsertReport {
    pub fn is_complete(&self) -> bool {
        self.inserted_ids.len() == self.requested
    }

    /// `PartialBatchFailure` unless every draft was inserted.
    pub fn into_result(self) -> Result<Vec<TaskId>, QueueError> {
        if self.is_complete() {
            return Ok(self.inserted_ids);
        }
        Err(QueueError::PartialBatchFailure {
            operation: "append_many",
            requested: self.requested,
            affected: self.inserted_ids.len(),
        })
    }
}

impl TaskQueue {
    /// Inserts one NEW task.
    pub async fn append(&self, payload: Value, priority: i64) -> Result<TaskId, QueueError> {
        self.append_draft(TaskDraft::new(payload).with_priority(priority)).await
    }

    pub async fn append_draft(&self, draft: TaskDraft) -> Result<TaskId, QueueError> {
        let out = self.store.insert_one(draft, self.now()).await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected { operation: "append" });
        }
        debug!(task_id = %out.id, "Appended task");
        Ok(out.id)
    }

    /// Inserts NEW tasks in bulk.
    ///
    /// `ordered` stops at the first rejected draft, leaving the ones before it
    /// inserted; otherwise every draft is attempted. Individual rejections
    /// land in the report rather than failing the call.
    pub async fn append_many(
        &self,
        drafts: Vec<TaskDraft>,
        ordered: bool,
    ) -> Result<InsertReport, QueueError> {
        let requested = drafts.len();
        if requested == 0 {
            return Ok(InsertReport {
                requested,
                inserted_ids: Vec::new(),
                failures: Vec::new(),
            });
        }

        let out = self.store.insert_many(drafts, self.now(), ordered).await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected { operation: "append_many" });
        }

        let report = InsertReport {
            requested,
            inserted_ids: out.inserted_ids,
            failures: out.failures,
        };
        if report.is_complete() {
            debug!(inserted = requested, "Appended tasks");
        } else {
            warn!(
                requested,
                inserted = report.inserted_ids.len(),
                failures = report.failures.len(),
                ordered,
                "Bulk append was partial"
            );
        }
        Ok(report)
    }

    /// Atomically removes and returns the front SUCCESSFUL task.
    pub async fn pop(&self) -> Result<Option<TaskRecord>, QueueError> {
        let popped = self
            .store
            .find_one_and_delete(&Filter::Status(TaskStatus::Successful), &Sort::queue_order())
            .await?;
        if let Some(task) = &popped {
            debug!(task_id = %task.id, "Drained completed task");
        }
        Ok(popped)
    }
}
