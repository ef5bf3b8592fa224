//! TaskStore port - キューが前提とするドキュメントストアの機能
//!
//! task record の所有者はストアです。実装は `find_one_and_update` /
//! `find_one_and_delete` をドキュメント単位でアトミックにすること。
//! キューが頼る排他はこれだけです。
//! 複数ドキュメントにまたがるトランザクションはありません。

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::warn;

use super::query::{Field, Filter, Sort, SortOrder, Update};
use crate::domain::{TaskDraft, TaskId, TaskRecord};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Set when an upsert inserted a new document.
    pub upserted: Option<TaskId>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOutcome {
    pub deleted: u64,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub id: TaskId,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertFailure {
    /// Position in the submitted batch.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InsertManyOutcome {
    pub inserted_ids: Vec<TaskId>,
    pub failures: Vec<InsertFailure>,
    pub acknowledged: bool,
}

/// Backing store adapter.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically update the first match under `sort` and return it post-update.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: &Sort,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Atomically remove the first match under `sort` and return it.
    async fn find_one_and_delete(
        &self,
        filter: &Filter,
        sort: &Sort,
    ) -> Result<Option<TaskRecord>, StoreError>;

    async fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Replace the first match with `record`, inserting it when nothing matches
    /// and `upsert` is set.
    async fn replace_one(
        &self,
        filter: &Filter,
        record: &TaskRecord,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn delete_many(&self, filter: &Filter) -> Result<DeleteOutcome, StoreError>;

    /// Insert one NEW task stamped with `now`.
    async fn insert_one(&self, draft: TaskDraft, now: f64) -> Result<InsertOutcome, StoreError>;

    /// Insert NEW tasks stamped with `now`. `ordered` stops at the first failure;
    /// otherwise every draft is attempted.
    async fn insert_many(
        &self,
        drafts: Vec<TaskDraft>,
        now: f64,
        ordered: bool,
    ) -> Result<InsertManyOutcome, StoreError>;

    async fn find(
        &self,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> Result<TaskCursor, StoreError>;

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError>;

    /// Returns the index name.
    async fn create_index(
        &self,
        keys: &[(Field,
        SortOrder)],
        background: bool,
    ) -> Result<String, StoreError>;
}

/// Lazy results of one query execution.
///
/// Not restartable: once `next` has returned `None` the cursor stays exhausted,
/// and running the query again means calling `find` again. Items that fail to
/// decode surface as `StoreError::InvalidDocument` without ending the cursor.
pub struct TaskCursor {
    inner: BoxStream<'static, Result<TaskRecord, StoreError>>,
    exhausted: bool,
}

impl TaskCursor {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<TaskRecord, StoreError>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            exhausted: false,
        }
    }

    pub fn from_results(items: Vec<Result<TaskRecord, StoreError>>) -> Self {
        Self::new(futures::stream::iter(items))
    }

    pub async fn next(&mut self) -> Option<Result<TaskRecord, StoreError>> {
        if self.exhausted {
            return None;
        }
        let item = self.inner.next().await;
        if item.is_none() {
            self.exhausted = true;
        }
        item
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Drains the cursor, skipping undecodable documents. Backend errors abort.
    pub async fn collect_valid(mut self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut records = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(record) => records.push(record),
                Err(StoreError::InvalidDocument { id, reason }) => {
                    warn!(id = ?id, reason = %reason, "Skipping invalid task document");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

impl std::fmt::Debug for TaskCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCursor").field("exhausted", &self.exhausted).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str) -> TaskRecord {
        TaskDraft::new(json!({})).into_record(TaskId::new(id), 1.0)
    }

    #[tokio::test]
    async fn cursor_is_single_use() {
        let mut cursor = TaskCursor::from_results(vec![Ok(task("a"))]);
        assert!(!cursor.is_exhausted());
        assert!(cursor.next().await.is_some());
        assert!(cursor.next().await.is_none());
        assert!(cursor.is_exhausted());
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn collect_valid_skips_invalid_documents() {
        let cursor = TaskCursor::from_results(vec![
            Ok(task("a")),
            Err(StoreError::invalid(Some("bad".into()), "missing field `status`")),
            Ok(task("b")),
        ]);
        let records = cursor.collect_valid().await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn collect_valid_stops_on_backend_errors() {
        let io = std::io::Error::other("connection reset");
        let cursor = TaskCursor::from_results(vec![Ok(task("a")), Err(StoreError::backend(io))]);
        assert!(matches!(cursor.collect_valid().await, Err(StoreError::Backend(_))));
    }
}
