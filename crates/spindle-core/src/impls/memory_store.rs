//! In-memory document store.
//!
//! Holds raw JSON documents in insertion order behind one async mutex, which
//! makes every operation atomic, including the multi-document ones. Documents
//! are decoded on each access, so a malformed document put in through
//! `insert_raw` behaves the way a hand-edited one does in a real collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{TaskDraft, TaskId, TaskRecord};
use crate::error::StoreError;
use crate::ports::{
    DeleteOutcome, Field, Filter, IdGenerator, InsertFailure, InsertManyOutcome, InsertOutcome,
    Sort, SortOrder, SystemClock, TaskCursor, TaskStore, UlidGenerator, Update, UpdateOutcome,
};

struct MemoryState {
    /// Natural (insertion) order.
    documents: Vec<Value>,
    indexes: Vec<String>,
    /// When false, writes still apply but report `acknowledged = false`, like
    /// an unacknowledged write concern.
    acknowledge_writes: bool,
}

impl MemoryState {
    fn position_of(&self, id: &TaskId) -> Option<usize> {
        self.documents
            .iter()
            .position(|doc| doc.get("_id").and_then(Value::as_str) == Some(id.as_str()))
    }

    /// Decodable documents matching `filter`, with their positions.
    fn matching(&self, filter: &Filter) -> Vec<(usize, TaskRecord)> {
        self.documents
            .iter()
            .enumerate()
            .filter_map(|(pos, doc)| TaskRecord::from_document(doc.clone()).ok().map(|r| (pos, r)))
            .filter(|(_, record)| filter.matches(record))
            .collect()
    }

    /// First match under `sort`; ties keep natural order.
    fn first_match(&self, filter: &Filter, sort: &Sort) -> Option<(usize, TaskRecord)> {
        self.matching(filter)
            .into_iter()
            .min_by(|(_, a), (_, b)| sort.compare(a, b))
    }

    fn insert(&mut self, record: &TaskRecord) -> Result<(), StoreError> {
        if self.position_of(&record.id).is_some() {
            return Err(StoreError::DuplicateKey(record.id.clone()));
        }
        self.documents.push(record.to_document()?);
        Ok(())
    }
}

/// In-memory `TaskStore` for development, tests and demos.
pub struct InMemoryTaskStore {
    state: Arc<Mutex<MemoryState>>,
    id_gen: Box<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_id_generator(Box::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(id_gen: Box<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                documents: Vec::new(),
                indexes: Vec::new(),
                acknowledge_writes: true,
            })),
            id_gen,
        }
    }

    /// Insert a document verbatim, bypassing validation.
    pub async fn insert_raw(&self, doc: Value) {
        self.state.lock().await.documents.push(doc);
    }

    /// Every stored document, decodable or not, in natural order.
    pub async fn raw_documents(&self) -> Vec<Value> {
        self.state.lock().await.documents.clone()
    }

    pub async fn set_acknowledge_writes(&self, acknowledge: bool) {
        self.state.lock().await.acknowledge_writes = acknowledge;
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.state.lock().await.indexes.clone()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: &Sort,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let Some((pos, mut record)) = state.first_match(filter, sort) else {
            return Ok(None);
        };
        update.apply(&mut record);
        state.documents[pos] = record.to_document()?;
        Ok(Some(record))
    }

    async fn find_one_and_delete(
        &self,
        filter: &Filter,
        sort: &Sort,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let Some((pos, record)) = state.first_match(filter, sort) else {
            return Ok(None);
        };
        state.documents.remove(pos);
        Ok(Some(record))
    }

    async fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let matches = state.matching(filter);
        let mut outcome = UpdateOutcome {
            matched: matches.len() as u64,
            acknowledged: state.acknowledge_writes,
            ..UpdateOutcome::default()
        };
        for (pos, mut record) in matches {
            if update.apply(&mut record) {
                state.documents[pos] = record.to_document()?;
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    async fn replace_one(
        &self,
        filter: &Filter,
        record: &TaskRecord,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let acknowledged = state.acknowledge_writes;

        if let Some((pos, existing)) = state.matching(filter).into_iter().next() {
            if existing.id != record.id {
                return Err(StoreError::invalid(
                    Some(existing.id.to_string()),
                    "replacement may not change _id",
                ));
            }
            let modified = existing != *record;
            state.documents[pos] = record.to_document()?;
            return Ok(UpdateOutcome {
                matched: 1,
                modified: u64::from(modified),
                upserted: None,
                acknowledged,
            });
        }

        if !upsert {
            return Ok(UpdateOutcome {
                acknowledged,
                ..UpdateOutcome::default()
            });
        }
        state.insert(record)?;
        Ok(UpdateOutcome {
            upserted: Some(record.id.clone()),
            acknowledged,
            ..UpdateOutcome::default()
        })
    }

    async fn delete_many(&self, filter: &Filter) -> Result<DeleteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let acknowledged = state.acknowledge_writes;
        let before = state.documents.len();

        if *filter == Filter::All {
            state.documents.clear();
        } else {
            let doomed: Vec<usize> =
                state.matching(filter).into_iter().map(|(pos, _)| pos).collect();
            let mut pos = 0;
            state.documents.retain(|_| {
                let keep = !doomed.contains(&pos);
                pos += 1;
                keep
            });
        }

        Ok(DeleteOutcome {
            deleted: (before - state.documents.len()) as u64,
            acknowledged,
        })
    }

    async fn insert_one(&self, draft: TaskDraft, now: f64) -> Result<InsertOutcome, StoreError> {
        let id = draft.id.clone().unwrap_or_else(|| self.id_gen.generate_task_id());
        let record = draft.into_record(id.clone(), now);
        let mut state = self.state.lock().await;
        state.insert(&record)?;
        Ok(InsertOutcome {
            id,
            acknowledged: state.acknowledge_writes,
        })
    }

    async fn insert_many(
        &self,
        drafts: Vec<TaskDraft>,
        now: f64,
        ordered: bool,
    ) -> Result<InsertManyOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let mut outcome = InsertManyOutcome {
            acknowledged: state.acknowledge_writes,
            ..InsertManyOutcome::default()
        };

        for (index, draft) in drafts.into_iter().enumerate() {
            let id = draft.id.clone().unwrap_or_else(|| self.id_gen.generate_task_id());
            match state.insert(&draft.into_record(id.clone(), now)) {
                Ok(()) => outcome.inserted_ids.push(id),
                Err(e) => {
                    outcome.failures.push(InsertFailure {
                        index,
                        reason: e.to_string(),
                    });
                    if ordered {
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> Result<TaskCursor, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> =
            state.matching(filter).into_iter().map(|(_, r)| r).collect();
        records.sort_by(|a, b| sort.compare(a, b));

        let mut items: Vec<Result<TaskRecord, StoreError>> = records.into_iter().map(Ok).collect();
        // An unfiltered scan also reports what could not be decoded, after the
        // readable documents.
        if *filter == Filter::All {
            items.extend(
                state
                    .documents
                    .iter()
                    .filter_map(|doc| TaskRecord::from_document(doc.clone()).err())
                    .map(Err),
            );
        }
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(TaskCursor::from_results(items))
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        if *filter == Filter::All {
            return Ok(state.documents.len() as u64);
        }
        Ok(state.matching(filter).len() as u64)
    }

    async fn create_index(
        &self,
        keys: &[(Field,
        SortOrder)],
        _background: bool,
    ) -> Result<String, StoreError> {
        let name = keys
            .iter()
            .map(|(field, order)| {
                let dir = match order {
                    SortOrder::Ascending => 1,
                    SortOrder::Descending => -1,
                };
                format!("{}_{}", field.key(), dir)
            })
            .collect::<Vec<_>>()
            .join("_");

        let mut state = self.state.lock().await;
        if !state.indexes.contains(&name) {
            debug!(index = %name, "Created index");
            state.indexes.push(name.clone());
        }
        Ok(name)
    }
}
