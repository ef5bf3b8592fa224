//! Identifiers: the store-assigned task key and the worker tag.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use ulid::Ulid;

/// Opaque, immutable task identifier assigned by the backing store.
///
/// The in-memory store hands out ULIDs, MongoDB hands out ObjectIds. Both end up
/// here as their canonical string form, so the core never depends on either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Accepts a plain string or the extended-JSON `{"$oid": "..."}` shape that
// ObjectIds take when they pass through serde.
impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Plain(String),
            ObjectId {
                #[serde(rename = "$oid")]
                oid: String,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Plain(s) => TaskId(s),
            Repr::ObjectId { oid } => TaskId(oid),
        })
    }
}

/// Identity a worker claims tasks under.
///
/// Always an explicit value owned by the queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerTag(String);

impl WorkerTag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `consumer_<pid>`, unique per process on one host.
    pub fn for_current_process() -> Self {
        Self(format!("consumer_{}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
