use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Task count per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub new: u64,
    pub pending: u64,
    pub successful: u64,
    pub failed: u64,
    /// Every document in the collection, including ones that fail to decode.
    pub total: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::New => self.new,
            TaskStatus::Pending => self.pending,
            TaskStatus::Successful => self.successful,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn set(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::New => self.new = count,
            TaskStatus::Pending => self.pending = count,
            TaskStatus::Successful => self.successful = count,
            TaskStatus::Failed => self.failed = count,
        }
    }

    /// Documents with no recognisable status.
    pub fn unreadable(&self) -> u64 {
        self.total
            .saturating_sub(self.new + self.pending + self.successful + self.failed)
    }
}
