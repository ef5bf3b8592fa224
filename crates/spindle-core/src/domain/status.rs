//! Task status and the lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle status.
///
/// State transitions:
/// - New -> Pending (claim)
/// - Pending -> Successful (report success)
/// - Pending -> Failed (report failure, lease expiry)
/// - Pending -> New (release for retry)
/// - Failed -> Pending (re-claim while retries < max_retries)
///
/// Successful is terminal; the only way out is being drained by `pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Pending,
    Successful,
    Failed,
}

/// Something that happens to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Claim,
    Succeed,
    Fail,
    Expire,
    Release,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::New,
        TaskStatus::Pending,
        TaskStatus::Successful,
        TaskStatus::Failed,
    ];

    /// Statuses a claim may pick up (subject to the retry bound).
    pub const CLAIMABLE: [TaskStatus; 2] = [TaskStatus::New, TaskStatus::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Successful => "SUCCESSFUL",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Successful)
    }

    pub fn is_claimable(self) -> bool {
        Self::CLAIMABLE.contains(&self)
    }

    /// Target status of `event`, or `None` when the event is not defined from
    /// this status.
    pub fn on(self, event: TaskEvent) -> Option<TaskStatus> {
        match (self, event) {
            (TaskStatus::New | TaskStatus::Failed, TaskEvent::Claim) => Some(TaskStatus::Pending),
            (TaskStatus::Pending, TaskEvent::Succeed) => Some(TaskStatus::Successful),
            (TaskStatus::Pending, TaskEvent::Fail | TaskEvent::Expire) => Some(TaskStatus::Failed),
            (TaskStatus::Pending, TaskEvent::Release) => Some(TaskStatus::New),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
