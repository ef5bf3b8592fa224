//! `TaskStore` over a MongoDB collection.

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::Collection;
use mongodb::IndexModel;
use mongodb::bson::Document;
use mongodb::bson::oid::ObjectId;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndDeleteOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, InsertManyOptions,
    ReplaceOptions, ReturnDocument,
};
use tracing::{debug, trace};

use spindle_core::StoreError;
use spindle_core::domain::{TaskDraft, TaskId, TaskRecord};
use spindle_core::ports::{
    DeleteOutcome, Field, Filter, InsertFailure, InsertManyOutcome, InsertOutcome, Sort, SortOrder,
    TaskCursor, TaskStore, Update, UpdateOutcome,
};

use crate::translate::{
    decode_record, encode_record, filter_doc, id_from_bson, index_keys, sort_doc, update_doc,
};

const DUPLICATE_KEY: i32 = 11000;

/// The driver surfaces write-concern problems as errors, so every result
/// that comes back was acknowledged.
const ACKNOWLEDGED: bool = true;

/// MongoDB-backed task store. The driver's collection handle is cheap to
/// clone and pools connections internally.
#[derive(Clone, Debug)]
pub struct MongoTaskStore {
    collection: Collection<Document>,
}

impl MongoTaskStore {
    pub fn new(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }
}

fn backend(err: mongodb::error::Error) -> StoreError {
    StoreError::backend(err)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

fn new_object_id() -> TaskId {
    TaskId::new(ObjectId::new().to_hex())
}

/// Decodes a document returned by an atomic operation. Unlike cursor items,
/// a malformed document here fails the operation.
fn decode_returned(doc: Option<Document>) -> Result<Option<TaskRecord>, StoreError> {
    doc.map(decode_record).transpose()
}

#[async_trait]
impl TaskStore for MongoTaskStore {
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: &Sort,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut options = FindOneAndUpdateOptions::default();
        options.sort = sort_doc(sort);
        options.return_document = Some(ReturnDocument::After);

        let doc = self
            .collection
            .find_one_and_update(filter_doc(filter), update_doc(update), options)
            .await
            .map_err(backend)?;
        decode_returned(doc)
    }

    async fn find_one_and_delete(
        &self,
        filter: &Filter,
        sort: &Sort,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut options = FindOneAndDeleteOptions::default();
        options.sort = sort_doc(sort);

        let doc = self
            .collection
            .find_one_and_delete(filter_doc(filter), options)
            .await
            .map_err(backend)?;
        decode_returned(doc)
    }

    async fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError> {
        let result = self
            .collection
            .update_many(filter_doc(filter), update_doc(update), None)
            .await
            .map_err(backend)?;
        trace!(matched = result.matched_count, modified = result.modified_count, "update_many");
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: None,
            acknowledged: ACKNOWLEDGED,
        })
    }

    async fn replace_one(
        &self,
        filter: &Filter,
        record: &TaskRecord,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut options = ReplaceOptions::default();
        options.upsert = Some(upsert);

        let result = self
            .collection
            .replace_one(filter_doc(filter), encode_record(record)?, options)
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    StoreError::DuplicateKey(record.id.clone())
                } else {
                    backend(e)
                }
            })?;
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: result.upserted_id.as_ref().map(id_from_bson),
            acknowledged: ACKNOWLEDGED,
        })
    }

    async fn delete_many(&self, filter: &Filter) -> Result<DeleteOutcome, StoreError> {
        let result = self
            .collection
            .delete_many(filter_doc(filter), None)
            .await
            .map_err(backend)?;
        Ok(DeleteOutcome {
            deleted: result.deleted_count,
            acknowledged: ACKNOWLEDGED,
        })
    }

    async fn insert_one(&self, draft: TaskDraft, now: f64) -> Result<InsertOutcome, StoreError> {
        let id = draft.id.clone().unwrap_or_else(new_object_id);
        let record = draft.into_record(id.clone(), now);

        self.collection
            .insert_one(encode_record(&record)?, None)
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    StoreError::DuplicateKey(id.clone())
                } else {
                    backend(e)
                }
            })?;
        Ok(InsertOutcome {
            id,
            acknowledged: ACKNOWLEDGED,
        })
    }

    async fn insert_many(
        &self,
        drafts: Vec<TaskDraft>,
        now: f64,
        ordered: bool,
    ) -> Result<InsertManyOutcome, StoreError> {
        if drafts.is_empty() {
            return Ok(InsertManyOutcome {
                acknowledged: ACKNOWLEDGED,
                ..InsertManyOutcome::default()
            });
        }

        // Ids are assigned up front so the outcome can name them even when
        // the server rejects part of the batch.
        let mut ids = Vec::with_capacity(drafts.len());
        let mut docs = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = draft.id.clone().unwrap_or_else(new_object_id);
            docs.push(encode_record(&draft.into_record(id.clone(), now))?);
            ids.push(id);
        }

        let mut options = InsertManyOptions::default();
        options.ordered = Some(ordered);

        let failures = match self.collection.insert_many(docs, options).await {
            Ok(_) => Vec::new(),
            Err(e) => {
                let rejected = match e.kind.as_ref() {
                    ErrorKind::BulkWrite(failure) => failure.write_errors.as_ref().map(|errors| {
                        errors
                            .iter()
                            .map(|w| InsertFailure {
                                index: w.index,
                                reason: w.message.clone(),
                            })
                            .collect::<Vec<_>>()
                    }),
                    _ => None,
                };
                match rejected {
                    Some(failures) => failures,
                    None => return Err(backend(e)),
                }
            }
        };

        // An ordered insert stops at its first failure.
        let stop = if ordered {
            failures.iter().map(|f| f.index).min().unwrap_or(ids.len())
        } else {
            ids.len()
        };
        let inserted_ids = ids
            .into_iter()
            .enumerate()
            .filter(|(index, _)| *index < stop && !failures.iter().any(|f| f.index == *index))
            .map(|(_, id)| id)
            .collect();

        Ok(InsertManyOutcome {
            inserted_ids,
            failures,
            acknowledged: ACKNOWLEDGED,
        })
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> Result<TaskCursor, StoreError> {
        let mut options = FindOptions::default();
        options.sort = sort_doc(sort);
        options.limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));

        let cursor = self
            .collection
            .find(filter_doc(filter), options)
            .await
            .map_err(backend)?;
        Ok(TaskCursor::new(cursor.map(|item| match item {
            Ok(doc) => decode_record(doc),
            Err(e) => Err(backend(e)),
        })))
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        self.collection
            .count_documents(filter_doc(filter), None)
            .await
            .map_err(backend)
    }

    async fn create_index(
        &self,
        keys: &[(Field,
        SortOrder)],
        background: bool,
    ) -> Result<String, StoreError> {
        let model = IndexModel::builder()
            .keys(index_keys(keys))
            .options(IndexOptions::builder().background(background).build())
            .build();
        let result = self.collection.create_index(model, None).await.map_err(backend)?;
        debug!(index = %result.index_name, collection = %self.collection.name(), "Created index");
        Ok(result.index_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn generated_ids_are_object_ids() {
        let id = new_object_id();
        assert_eq!(id.as_str().len(), 24);
        assert!(ObjectId::parse_str(id.as_str()).is_ok());
        assert_ne!(id, new_object_id());
    }

    #[test]
    fn returned_documents_must_decode() {
        assert_eq!(decode_returned(None).unwrap(), None);
        let err = decode_returned(Some(doc! { "_id": "x" })).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { .. }));
    }
}
