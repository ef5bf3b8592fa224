//! Lease expiry.

use tracing::info;

use super::TaskQueue;
use crate::domain::TaskStatus;
use crate::error::QueueError;
use crate::ports::{Filter, Update};

impl TaskQueue {
    /// Reclaims PENDING tasks whose lease outlived the ttl: they become FAILED,
    /// unassigned, with one more retry. Returns how many were reclaimed.
    ///
    /// A queue with `ttl = -1` only sweeps when `force` is set, and then every
    /// lease touched before `now + 1s` counts as expired.
    pub async fn sweep_expired(&self, force: bool) -> Result<u64, QueueError> {
        if !self.config.expires() && !force {
            return Ok(0);
        }

        let now = self.now();
        let cutoff = self.config.lease_cutoff(now);
        let filter = Filter::and([
            Filter::Assigned,
            Filter::ModifiedBefore(cutoff),
            Filter::Status(TaskStatus::Pending),
        ]);
        let update = Update::new()
            .unassign()
            .status(TaskStatus::Failed)
            .inc_retries()
            .touch(now);

        let out = self.store.update_many(&filter, &update).await?;
        if !out.acknowledged {
            return Err(QueueError::WriteRejected {
                operation: "sweep_expired",
            });
        }
        if out.matched == 0 {
            info!("No expired tasks found");
        } else {
            info!(matched = out.matched, modified = out.modified, cutoff, "Expired stale leases");
        }
        Ok(out.modified)
    }
}
