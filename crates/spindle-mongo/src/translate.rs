//! Typed query model -> MongoDB query documents, and records <-> BSON.

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document, doc};
use spindle_core::StoreError;
use spindle_core::domain::{TaskId, TaskRecord, TaskStatus};
use spindle_core::ports::{Field, Filter, Sort, SortOrder, Update};

/// Ids that look like ObjectIds are stored as ObjectIds; anything else (an
/// explicit id supplied on append) as a string.
pub fn id_to_bson(id: &TaskId) -> Bson {
    match ObjectId::parse_str(id.as_str()) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(id.as_str().to_string()),
    }
}

pub fn id_from_bson(value: &Bson) -> TaskId {
    match value {
        Bson::ObjectId(oid) => TaskId::new(oid.to_hex()),
        Bson::String(s) => TaskId::new(s.clone()),
        other => TaskId::new(other.to_string()),
    }
}

fn statuses(list: &[TaskStatus]) -> Vec<Bson> {
    list.iter().map(|s| Bson::String(s.as_str().to_string())).collect()
}

pub fn filter_doc(filter: &Filter) -> Document {
    match filter {
        Filter::All => doc! {},
        Filter::And(parts) if parts.is_empty() => doc! {},
        Filter::And(parts) => {
            let parts: Vec<Bson> = parts.iter().map(|f| Bson::Document(filter_doc(f))).collect();
            doc! { "$and": parts }
        }
        Filter::Id(id) => doc! { "_id": id_to_bson(id) },
        Filter::IdIn(ids) => {
            let ids: Vec<Bson> = ids.iter().map(id_to_bson).collect();
            doc! { "_id": { "$in": ids } }
        }
        Filter::Status(status) => doc! { "status": status.as_str() },
        Filter::StatusIn(list) => doc! { "status": { "$in": statuses(list) } },
        Filter::StatusNotIn(list) => doc! { "status": { "$nin": statuses(list) } },
        // `null` also matches a missing field.
        Filter::Unassigned => doc! { "assignedTo": Bson::Null },
        Filter::Assigned => doc! { "assignedTo": { "$ne": Bson::Null } },
        Filter::AssignedTo(tag) => doc! { "assignedTo": tag.as_str() },
        // A missing `retries` counts as 0.
        Filter::RetriesBelow(n) => doc! { "retries": { "$not": { "$gte": i64::from(*n) } } },
        Filter::RetriesAtLeast(n) => doc! { "retries": { "$gte": i64::from(*n) } },
        Filter::ModifiedBefore(ts) => doc! { "modifiedAt": { "$lt": *ts } },
        Filter::ClaimToken(token) => doc! { "claimToken": token.as_str() },
    }
}

fn optional_string(value: &Option<String>) -> Bson {
    match value {
        Some(s) => Bson::String(s.clone()),
        None => Bson::Null,
    }
}

pub fn update_doc(update: &Update) -> Document {
    let mut set = Document::new();
    if let Some(status) = update.status {
        set.insert(Field::Status.key(), status.as_str());
    }
    if let Some(assigned_to) = &update.assigned_to {
        set.insert(Field::AssignedTo.key(), optional_string(assigned_to));
    }
    if let Some(ts) = update.modified_at {
        set.insert(Field::ModifiedAt.key(), ts);
    }
    if let Some(message) = &update.error_message {
        set.insert(Field::ErrorMessage.key(), optional_string(message));
    }
    if let Some(token) = &update.claim_token {
        set.insert(Field::ClaimToken.key(), optional_string(token));
    }

    let mut out = Document::new();
    if !set.is_empty() {
        out.insert("$set", set);
    }
    if update.inc_retries > 0 {
        let mut inc = Document::new();
        inc.insert(Field::Retries.key(), i64::from(update.inc_retries));
        out.insert("$inc", inc);
    }
    out
}

pub fn sort_doc(sort: &Sort) -> Option<Document> {
    if sort.is_empty() {
        return None;
    }
    let mut out = Document::new();
    for (field, order) in sort.keys() {
        let dir = match order {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        };
        out.insert(field.key(), dir);
    }
    Some(out)
}

pub fn index_keys(keys: &[(Field, SortOrder)]) -> Document {
    sort_doc(&Sort::new(keys.to_vec())).unwrap_or_default()
}

/// Record -> BSON document, `_id` as an ObjectId where possible.
pub fn encode_record(record: &TaskRecord) -> Result<Document, StoreError> {
    let invalid = |reason: String| StoreError::invalid(Some(record.id.to_string()), reason);

    let mut doc = match Bson::try_from(record.to_document()?).map_err(|e| invalid(e.to_string()))? {
        Bson::Document(doc) => doc,
        other => return Err(invalid(format!("expected a document, got {other}"))),
    };
    doc.insert("_id", id_to_bson(&record.id));
    Ok(doc)
}

/// BSON document -> record, through the same validated decode the in-memory
/// store uses. ObjectIds arrive as `{"$oid": ..}`.
pub fn decode_record(doc: Document) -> Result<TaskRecord, StoreError> {
    TaskRecord::from_document(Bson::Document(doc).into_relaxed_extjson())
}
