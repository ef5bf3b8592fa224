//! Task record: the persisted unit of work.

use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus, WorkerTag};
use crate::error::StoreError;

/// One task document as stored in the backing collection.
///
/// Field names follow the persisted document keys (`_id`, `assignedTo`,
/// `createdAt`, ...). Timestamps are seconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(rename = "_id")]
    pub id: TaskId,

    pub payload: serde_json::Value,

    /// Higher is claimed first.
    #[serde(default)]
    pub priority: i64,

    pub status: TaskStatus,

    /// Set while claimed.
    #[serde(default)]
    pub assigned_to: Option<String>,

    pub created_at: f64,
    pub modified_at: f64,

    /// Failure, expiry and release events so far.
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Marks the documents one `claim_many` call took, so its read-back
    /// cannot pick up a single claim made under the same tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
}

impl TaskRecord {
    /// Validated decode of a raw document.
    pub fn from_document(doc: serde_json::Value) -> Result<Self, StoreError> {
        let id = doc.get("_id").map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        if !doc.is_object() {
            return Err(StoreError::invalid(id, "document is not an object"));
        }
        let record: TaskRecord = serde_json::from_value(doc)
            .map_err(|e| StoreError::invalid(id.clone(), e.to_string()))?;
        if !record.created_at.is_finite() || !record.modified_at.is_finite() {
            return Err(StoreError::invalid(id, "timestamps must be finite"));
        }
        Ok(record)
    }

    pub fn to_document(&self) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(self)
            .map_err(|e| StoreError::invalid(Some(self.id.to_string()), e.to_string()))
    }

    pub fn is_assigned_to(&self, tag: &WorkerTag) -> bool {
        self.assigned_to.as_deref() == Some(tag.as_str())
    }

    /// Pending -> Successful.
    pub fn mark_succeeded(&mut self, now: f64) {
        self.status = TaskStatus::Successful;
        self.assigned_to = None;
        self.claim_token = None;
        self.modified_at = now;
    }

    /// Pending -> Failed, counting one retry.
    pub fn mark_failed(&mut self, error_message: Option<String>, now: f64) {
        self.status = TaskStatus::Failed;
        self.assigned_to = None;
        self.claim_token = None;
        self.error_message = error_message;
        self.retries = self.retries.saturating_add(1);
        self.modified_at = now;
    }
}

/// A task about to be inserted. The store assigns the identifier unless one is
/// supplied (bulk re-imports carry their own).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub id: Option<TaskId>,
    pub payload: serde_json::Value,
    pub priority: i64,
}

impl TaskDraft {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: None,
            payload,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// The only place a NEW record is constructed.
    pub fn into_record(self, id: TaskId, now: f64) -> TaskRecord {
        TaskRecord {
            id,
            payload: self.payload,
            priority: self.priority,
            status: TaskStatus::New,
            assigned_to: None,
            created_at: now,
            modified_at: now,
            retries: 0,
            error_message: None,
            claim_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskDraft::new(json!({"n": 1}))
            .with_priority(5)
            .into_record(TaskId::new("t-1"), 100.0)
    }

    #[test]
    fn draft_builds_a_new_unassigned_record() {
        let r = record();
        assert_eq!(r.status, TaskStatus::New);
        assert_eq!(r.priority, 5);
        assert_eq!(r.retries, 0);
        assert_eq!(r.assigned_to, None);
        assert_eq!(r.created_at, r.modified_at);
    }

    #[test]
    fn document_uses_persisted_field_names() {
        let doc = record().to_document().unwrap();
        assert_eq!(doc["_id"], "t-1");
        assert_eq!(doc["status"], "NEW");
        assert!(doc.get("assignedTo").is_some());
        assert!(doc.get("createdAt").is_some());
        assert!(doc.get("errorMessage").is_some());
        assert!(doc.get("claimToken").is_none());

        let back = TaskRecord::from_document(doc).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn decode_fills_optional_fields() {
        let doc = json!({
            "_id": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"},
            "payload": "x",
            "status": "FAILED",
            "createdAt": 1.0,
            "modifiedAt": 2.0,
        });
        let r = TaskRecord::from_document(doc).unwrap();
        assert_eq!(r.id.as_str(), "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(r.priority, 0);
        assert_eq!(r.retries, 0);
        assert_eq!(r.assigned_to, None);
    }

    #[test]
    fn decode_rejects_malformed_documents() {
        let missing_status = json!({"_id": "a", "payload": 1, "createdAt": 1.0, "modifiedAt": 1.0});
        let err = TaskRecord::from_document(missing_status).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { id: Some(ref id), .. } if id == "a"));

        let bad_status = json!({
            "_id": "b", "payload": 1, "status": "RUNNING", "createdAt": 1.0, "modifiedAt": 1.0
        });
        assert!(TaskRecord::from_document(bad_status).is_err());

        let negative_retries = json!({
            "_id": "c", "payload": 1, "status": "NEW", "createdAt": 1.0, "modifiedAt": 1.0,
            "retries": -1
        });
        assert!(TaskRecord::from_document(negative_retries).is_err());

        assert!(TaskRecord::from_document(json!([1, 2])).is_err());
    }

    #[test]
    fn marking_failed_counts_a_retry_and_releases_the_worker() {
        let mut r = record();
        r.status = TaskStatus::Pending;
        r.assigned_to = Some("w".into());
        r.mark_failed(Some("boom".into()), 150.0);
        assert_eq!(r.status, TaskStatus::Failed);
        assert_eq!(r.retries, 1);
        assert_eq!(r.assigned_to, None);
        assert_eq!(r.error_message.as_deref(), Some("boom"));
        assert_eq!(r.modified_at, 150.0);
    }
}
