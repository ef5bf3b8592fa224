//! Ports - 外部システムとの境界
//!
//! ドキュメントストア、時刻、ID 生成はすべてここの trait で表現します。
//! `queue` のライフサイクルロジックは具体的な実装を名指ししません。

pub mod clock;
pub mod id_generator;
pub mod query;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::query::{Field, Filter, Sort, SortOrder, Update};
pub use self::task_store::{
    DeleteOutcome, InsertFailure, InsertManyOutcome, InsertOutcome, TaskCursor, TaskStore,
    UpdateOutcome,
};
