//! Retry bound and discard sweep.

use tracing::info;

use super::TaskQueue;
use super::config::DiscardStrategy;
use crate::domain::{TaskRecord, TaskStatus};
use crate::error::QueueError;
use crate::ports::Filter;

/// Decides which tasks have used up their retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardPolicy {
    pub max_retries: u32,
    pub strategy: DiscardStrategy,
}

impl DiscardPolicy {
    pub fn new(max_retries: u32, strategy: DiscardStrategy) -> Self {
        Self { max_retries, strategy }
    }

    /// Claimable: unassigned, retries left, and NEW or FAILED.
    pub fn claimable(&self) -> Filter {
        Filter::and([
            Filter::Unassigned,
            Filter::RetriesBelow(self.max_retries),
            Filter::StatusIn(TaskStatus::CLAIMABLE.to_vec()),
        ])
    }

    /// Exhausted tasks. PENDING and SUCCESSFUL tasks never qualify, whatever
    /// their retry count.
    pub fn exhausted(&self) -> Filter {
        Filter::and([
            Filter::RetriesAtLeast(self.max_retries),
            Filter::StatusNotIn(vec![TaskStatus::Pending, TaskStatus::Successful]),
        ])
    }

    pub fn is_exhausted(&self, record: &TaskRecord) -> bool {
        self.exhausted().matches(record)
    }
}

impl TaskQueue {
    pub fn discard_policy(&self) -> DiscardPolicy {
        DiscardPolicy::new(self.config.max_retries(), self.config.discard_strategy())
    }

    /// Applies the discard strategy to exhausted tasks. Returns how many were
    /// deleted (always 0 under `keep`).
    pub async fn sweep_discards(&self) -> Result<u64, QueueError> {
        let policy = self.discard_policy();
        match policy.strategy {
            DiscardStrategy::Keep => {
                let retained = self.store.count(&policy.exhausted()).await?;
                info!(
                    retained,
                    max_retries = policy.max_retries,
                    "Discard strategy is keep; exhausted tasks retained"
                );
                Ok(0)
            }
            DiscardStrategy::Remove => {
                let out = self.store.delete_many(&policy.exhausted()).await?;
                if !out.acknowledged {
                    return Err(QueueError::WriteRejected {
                        operation: "sweep_discards",
                    });
                }
                if out.deleted == 0 {
                    info!("No discardable tasks found");
                } else {
                    info!(
                        deleted = out.deleted,
                        max_retries = policy.max_retries,
                        "Discarded exhausted tasks"
                    );
                }
                Ok(out.deleted)
            }
        }
    }
}
