//! spindle-core
//!
//! A persistent task queue over a document store. Workers claim tasks with one
//! atomic update, report outcomes, and the queue recovers abandoned claims by
//! lease expiry.
//!
//! # Modules
//! - **domain**: task record, status state machine, ids
//! - **ports**: the `TaskStore` seam with its typed query model, `Clock`, `IdGenerator`
//! - **impls**: `InMemoryTaskStore`
//! - **queue**: `TaskQueue`, the lifecycle protocol (claim, report, drain, expiry, discard and
//!   anomaly healing)
//! - **app**: worker and maintenance loops
//! - **error**: `StoreError`, `QueueError`, `ConfigError`

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use domain::{TaskDraft, TaskId, TaskRecord, TaskStatus, WorkerTag};
pub use error::{ConfigError, QueueError, StoreError};
pub use observability::StatusCounts;
pub use queue::{DiscardStrategy, QueueConfig, TaskQueue};
