//! spindle-mongo
//!
//! MongoDB backing store for `spindle-core`, plus collection provisioning.

mod store;
pub mod translate;

pub use store::MongoTaskStore;

use std::sync::Arc;

use mongodb::bson::{Document, doc};
use mongodb::{Client, Database};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use spindle_core::{QueueConfig, QueueError, TaskQueue};

pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

#[derive(Debug, Error)]
pub enum MongoError {
    #[error("mongodb: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Where the queue lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MongoArgs {
    pub uri: String,
    pub database: String,
    pub collection: String,
}

impl Default for MongoArgs {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            database: "spindle".to_string(),
            collection: "tasks".to_string(),
        }
    }
}

pub async fn connect(args: &MongoArgs) -> Result<Database, MongoError> {
    let client = Client::with_uri_str(&args.uri).await?;
    Ok(client.database(&args.database))
}

/// Opens the queue collection, creating it and its index on first use.
pub async fn open_queue(args: &MongoArgs, config: QueueConfig) -> Result<TaskQueue, MongoError> {
    let db = connect(args).await?;
    let existing = db
        .list_collection_names(doc! { "name": args.collection.as_str() })
        .await?;
    let fresh = existing.is_empty();
    if fresh {
        db.create_collection(&args.collection, None).await?;
    }

    let store = MongoTaskStore::new(db.collection::<Document>(&args.collection));
    let queue = TaskQueue::new(Arc::new(store), config);
    if fresh {
        queue.create_index().await?;
        info!(
            database = %args.database,
            collection = %args.collection,
            "Created task collection"
        );
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_fill_missing_fields_with_defaults() {
        let args: MongoArgs =
            serde_json::from_value(serde_json::json!({ "collection": "jobs" })).unwrap();
        assert_eq!(args.uri, DEFAULT_URI);
        assert_eq!(args.database, "spindle");
        assert_eq!(args.collection, "jobs");
    }

    #[test]
    fn args_reject_unknown_fields() {
        let res: Result<MongoArgs, _> = serde_json::from_value(serde_json::json!({ "host": "x" }));
        assert!(res.is_err());
    }
}
