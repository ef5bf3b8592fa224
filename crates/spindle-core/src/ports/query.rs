//! Typed query model shared by every backing store.
//!
//! The lifecycle core only ever talks to a store through these values, so the
//! same claim/expiry/anomaly logic runs against the in-memory store and MongoDB.
//! Each store either evaluates them directly (`Filter::matches`,
//! `Update::apply`, `Sort::compare`) or translates them to its own query language.

use std::cmp::Ordering;

use crate::domain::{TaskId, TaskRecord, TaskStatus, WorkerTag};

/// A persisted task field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    Payload,
    Priority,
    Status,
    AssignedTo,
    CreatedAt,
    ModifiedAt,
    Retries,
    ErrorMessage,
    ClaimToken,
}

impl Field {
    /// Document key of the field.
    pub fn key(self) -> &'static str {
        match self {
            Field::Id => "_id",
            Field::Payload => "payload",
            Field::Priority => "priority",
            Field::Status => "status",
            Field::AssignedTo => "assignedTo",
            Field::CreatedAt => "createdAt",
            Field::ModifiedAt => "modifiedAt",
            Field::Retries => "retries",
            Field::ErrorMessage => "errorMessage",
            Field::ClaimToken => "claimToken",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Ordered sort keys, first key most significant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sort(Vec<(Field, SortOrder)>);

impl Sort {
    pub fn new(keys: Vec<(Field, SortOrder)>) -> Self {
        Self(keys)
    }

    /// Natural store order.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Front of the queue first: priority descending, then oldest first.
    pub fn queue_order() -> Self {
        Self(vec![
            (Field::Priority, SortOrder::Descending),
            (Field::CreatedAt, SortOrder::Ascending),
        ])
    }

    /// Back of the queue first: priority descending, then newest first.
    pub fn reverse_queue_order() -> Self {
        Self(vec![
            (Field::Priority, SortOrder::Descending),
            (Field::CreatedAt, SortOrder::Descending),
        ])
    }

    pub fn keys(&self) -> &[(Field, SortOrder)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn compare(&self, a: &TaskRecord, b: &TaskRecord) -> Ordering {
        for &(field, order) in &self.0 {
            let ord = compare_field(field, a, b);
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn compare_field(field: Field, a: &TaskRecord, b: &TaskRecord) -> Ordering {
    match field {
        Field::Id => a.id.cmp(&b.id),
        Field::Priority => a.priority.cmp(&b.priority),
        Field::Status => a.status.as_str().cmp(b.status.as_str()),
        Field::AssignedTo => a.assigned_to.cmp(&b.assigned_to),
        Field::CreatedAt => a.created_at.total_cmp(&b.created_at),
        Field::ModifiedAt => a.modified_at.total_cmp(&b.modified_at),
        Field::Retries => a.retries.cmp(&b.retries),
        Field::ErrorMessage => a.error_message.cmp(&b.error_message),
        Field::ClaimToken => a.claim_token.cmp(&b.claim_token),
        // Payloads are opaque.
        Field::Payload => Ordering::Equal,
    }
}

/// Document predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    And(Vec<Filter>),
    Id(TaskId),
    IdIn(Vec<TaskId>),
    Status(TaskStatus),
    StatusIn(Vec<TaskStatus>),
    StatusNotIn(Vec<TaskStatus>),
    /// `assignedTo = null`
    Unassigned,
    /// `assignedTo != null`
    Assigned,
    AssignedTo(String),
    RetriesBelow(u32),
    RetriesAtLeast(u32),
    /// `modifiedAt < ts`
    ModifiedBefore(f64),
    ClaimToken(String),
}

impl Filter {
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn assigned_to(tag: &WorkerTag) -> Self {
        Filter::AssignedTo(tag.as_str().to_string())
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        match self {
            Filter::All => true,
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Id(id) => &record.id == id,
            Filter::IdIn(ids) => ids.contains(&record.id),
            Filter::Status(status) => record.status == *status,
            Filter::StatusIn(statuses) => statuses.contains(&record.status),
            Filter::StatusNotIn(statuses) => !statuses.contains(&record.status),
            Filter::Unassigned => record.assigned_to.is_none(),
            Filter::Assigned => record.assigned_to.is_some(),
            Filter::AssignedTo(tag) => record.assigned_to.as_deref() == Some(tag.as_str()),
            Filter::RetriesBelow(n) => record.retries < *n,
            Filter::RetriesAtLeast(n) => record.retries >= *n,
            Filter::ModifiedBefore(ts) => record.modified_at < *ts,
            Filter::ClaimToken(token) => record.claim_token.as_deref() == Some(token.as_str()),
        }
    }
}

/// `$set` / `$inc` effects applied atomically to each matched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the assignment.
    pub assigned_to: Option<Option<String>>,
    pub modified_at: Option<f64>,
    pub error_message: Option<Option<String>>,
    pub claim_token: Option<Option<String>>,
    pub inc_retries: u32,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assign(mut self, tag: &WorkerTag) -> Self {
        self.assigned_to = Some(Some(tag.as_str().to_string()));
        self
    }

    /// Clears the assignment and any batch claim token with it.
    pub fn unassign(mut self) -> Self {
        self.assigned_to = Some(None);
        self.claim_token = Some(None);
        self
    }

    pub fn claim_token(mut self, token: Option<String>) -> Self {
        self.claim_token = Some(token);
        self
    }

    pub fn touch(mut self, now: f64) -> Self {
        self.modified_at = Some(now);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn inc_retries(mut self) -> Self {
        self.inc_retries += 1;
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Update::default()
    }

    /// Applies the update in place. Returns whether anything changed.
    pub fn apply(&self, record: &mut TaskRecord) -> bool {
        let before = record.clone();
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(assigned_to) = &self.assigned_to {
            record.assigned_to = assigned_to.clone();
        }
        if let Some(ts) = self.modified_at {
            record.modified_at = ts;
        }
        if let Some(message) = &self.error_message {
            record.error_message = message.clone();
        }
        if let Some(token) = &self.claim_token {
            record.claim_token = token.clone();
        }
        record.retries = record.retries.saturating_add(self.inc_retries);
        *record != before
    }
}
