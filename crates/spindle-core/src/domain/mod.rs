//! Domain - ID、ステータス遷移、task record

pub mod ids;
pub mod record;
pub mod status;

pub use self::ids::{TaskId, WorkerTag};
pub use self::record::{TaskDraft, TaskRecord};
pub use self::status::{TaskEvent, TaskStatus};
