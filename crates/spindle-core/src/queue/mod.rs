//! Queue module: the task lifecycle protocol over a `TaskStore`.
//!
//! `TaskQueue` holds no task state of its own. Every operation is one (or, for
//! `claim_many`, a few) round trips to the store, and all mutual exclusion comes
//! from the store's atomic single-document update.
//!
//! - `claim`: claim_one / claim_many
//! - `lifecycle`: report_success / report_failure / release_for_retry
//! - `drain`: append / append_many / pop
//! - `expiry`: sweep_expired
//! - `retry`: the retry bound and sweep_discards
//! - `anomaly`: detect (and heal)
//! - `view`: read-only listings and operator deletes

mod anomaly;
mod claim;
mod config;
mod drain;
mod expiry;
mod lifecycle;
mod retry;
mod view;

pub use anomaly::{Anomaly, AnomalyRegistry, HealReport};
pub use claim::ClaimBatch;
pub use config::{
    DEFAULT_MAX_RETRIES, DiscardStrategy, NEVER_EXPIRE, QueueConfig, QueueConfigBuilder,
};
pub use drain::InsertReport;
pub use retry::DiscardPolicy;

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::domain::WorkerTag;
use crate::error::{ConfigError, QueueError};
use crate::ports::{Clock, Field, Filter, SortOrder, SystemClock, TaskStore};

/// Keys of the compound index the queue's lookups rely on.
pub const INDEX_KEYS: [(Field, SortOrder); 3] = [
    (Field::Id, SortOrder::Ascending),
    (Field::AssignedTo, SortOrder::Ascending),
    (Field::ModifiedAt, SortOrder::Ascending),
];

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: u64,
    pub discarded: u64,
}

/// A task queue bound to one collection and one worker identity.
///
/// Cheap to clone; clones share the store and clock.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    anomalies: AnomalyRegistry,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, config: QueueConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            anomalies: AnomalyRegistry::default(),
        }
    }

    /// The same queue acting as another worker.
    pub fn for_worker(&self, tag: WorkerTag) -> Result<Self, ConfigError> {
        Ok(Self {
            config: self.config.with_worker_tag(tag)?,
            ..self.clone()
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn worker_tag(&self) -> &WorkerTag {
        self.config.worker_tag()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub(crate) fn now(&self) -> f64 {
        self.clock.timestamp()
    }

    /// Number of documents in the collection, well-formed or not.
    pub async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.store.count(&Filter::All).await?)
    }

    /// Maintenance cycle: expire stale leases, then apply the discard strategy.
    pub async fn refresh(&self) -> Result<MaintenanceReport, QueueError> {
        let expired = self.sweep_expired(false).await?;
        let discarded = self.sweep_discards().await?;
        Ok(MaintenanceReport { expired, discarded })
    }

    /// Builds the (`_id`, `assignedTo`, `modifiedAt`) index in the background.
    pub async fn create_index(&self) -> Result<String, QueueError> {
        let name = self.store.create_index(&INDEX_KEYS, true).await?;
        info!(index = %name, "Index ready");
        Ok(name)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.config)
            .field("anomalies", &self.anomalies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::{QueueConfig, TaskQueue};
    use crate::domain::WorkerTag;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;

    pub(crate) struct Harness {
        pub store: Arc<InMemoryTaskStore>,
        pub clock: Arc<FixedClock>,
        pub queue: TaskQueue,
    }

    /// In-memory queue for worker `w1` with a clock fixed at t = 1_700_000_000.
    pub(crate) fn harness(config: QueueConfig) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(FixedClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let config = config.with_worker_tag(WorkerTag::new("w1")).unwrap();
        let queue = TaskQueue::with_clock(store.clone(), clock.clone(), config);
        Harness { store, clock, queue }
    }

    pub(crate) fn default_harness() -> Harness {
        harness(QueueConfig::builder().build().unwrap())
    }
}
