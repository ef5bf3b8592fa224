//! Anomaly detection and healing.
//!
//! An anomaly is a persisted state no lifecycle transition can produce: the
//! footprint of manual edits or a write that died halfway. Each kind pairs a
//! filter with a corrective update. The detector iterates a registry of them,
//! so new kinds are added as data without touching the detector.

use tracing::{info, warn};

use super::TaskQueue;
use crate::domain::{TaskRecord, TaskStatus};
use crate::error::QueueError;
use crate::ports::{Filter, Sort, Update};

#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// Assigned to a worker while not PENDING.
    NonPendingAssigned,
    /// PENDING with nobody holding it.
    PendingUnassigned,
    Custom {
        name: String,
        filter: Filter,
        /// Applied with `modifiedAt` stamped at heal time.
        correction: Update,
    },
}

impl Anomaly {
    pub fn name(&self) -> &str {
        match self {
            Anomaly::NonPendingAssigned => "non-pending-assigned",
            Anomaly::PendingUnassigned => "pending-unassigned",
            Anomaly::Custom { name, .. } => name,
        }
    }

    pub fn filter(&self) -> Filter {
        match self {
            Anomaly::NonPendingAssigned => Filter::and([
                Filter::Assigned,
                Filter::StatusNotIn(vec![TaskStatus::Pending]),
            ]),
            Anomaly::PendingUnassigned => {
                Filter::and([Filter::Unassigned, Filter::Status(TaskStatus::Pending)])
            }
            Anomaly::Custom { filter, .. } => filter.clone(),
        }
    }

    pub fn correction(&self, now: f64) -> Update {
        match self {
            Anomaly::NonPendingAssigned => Update::new()
                .unassign()
                .status(TaskStatus::Failed)
                .inc_retries()
                .touch(now),
            Anomaly::PendingUnassigned => Update::new()
                .status(TaskStatus::Failed)
                .inc_retries()
                .touch(now),
            Anomaly::Custom { correction, .. } => correction.clone().touch(now),
        }
    }
}

/// The anomaly kinds a detection pass checks, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRegistry {
    anomalies: Vec<Anomaly>,
}

impl AnomalyRegistry {
    pub fn empty() -> Self {
        Self { anomalies: Vec::new() }
    }

    pub fn register(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter()
    }

    pub fn len(&self) -> usize {
        self.anomalies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anomalies.is_empty()
    }
}

impl Default for AnomalyRegistry {
    fn default() -> Self {
        Self {
            anomalies: vec![Anomaly::NonPendingAssigned, Anomaly::PendingUnassigned],
        }
    }
}

/// Result of checking one anomaly kind.
#[derive(Debug, Clone, PartialEq)]
pub struct HealReport {
    pub anomaly: String,
    pub found: Vec<TaskRecord>,
    /// `None` on a dry run.
    pub matched: Option<u64>,
    pub modified: Option<u64>,
}

impl HealReport {
    /// The healing update touched a different number of documents than were
    /// found, so the set changed between the two round trips.
    pub fn is_inconsistent(&self) -> bool {
        self.modified.is_some_and(|modified| modified != self.found.len() as u64)
    }
}

impl TaskQueue {
    pub fn anomalies(&self) -> &AnomalyRegistry {
        &self.anomalies
    }

    pub fn register_anomaly(&mut self, anomaly: Anomaly) {
        self.anomalies.register(anomaly);
    }

    /// Runs every registered anomaly check, one report per kind. With
    /// `dry_run = false` the corrective update of each kind with findings is
    /// applied in one multi-document update.
    pub async fn detect(&self, dry_run: bool) -> Result<Vec<HealReport>, QueueError> {
        let mut reports = Vec::with_capacity(self.anomalies.len());

        for anomaly in self.anomalies.iter() {
            let filter = anomaly.filter();
            let found = self.store.find(&filter, &Sort::none(), None).await?.collect_valid().await?;

            let mut report = HealReport {
                anomaly: anomaly.name().to_string(),
                found,
                matched: None,
                modified: None,
            };

            if report.found.is_empty() {
                info!(anomaly = anomaly.name(), "No anomalies found");
                reports.push(report);
                continue;
            }

            for task in &report.found {
                warn!(
                    anomaly = anomaly.name(),
                    task_id = %task.id,
                    status = %task.status,
                    assigned_to = ?task.assigned_to,
                    retries = task.retries,
                    "Anomalous task"
                );
            }
            warn!(anomaly = anomaly.name(), found = report.found.len(), dry_run, "Anomalies found");

            if !dry_run {
                let out = self.store.update_many(&filter, &anomaly.correction(self.now())).await?;
                if !out.acknowledged {
                    return Err(QueueError::WriteRejected { operation: "detect" });
                }
                report.matched = Some(out.matched);
                report.modified = Some(out.modified);

                if report.is_inconsistent() {
                    warn!(
                        anomaly = anomaly.name(),
                        found = report.found.len(),
                        matched = out.matched,
                        modified = out.modified,
                        "Healed count differs from found count; the set changed concurrently"
                    );
                } else {
                    info!(anomaly = anomaly.name(), modified = out.modified, "Anomalies healed");
                }
            }

            reports.push(report);
        }

        Ok(reports)
    }
}
