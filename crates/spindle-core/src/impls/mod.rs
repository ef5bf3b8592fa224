//! Impls - ports のプロセス内実装
//!
//! 本番用のストアは別 crate（`spindle-mongo`）にあります。

pub mod memory_store;

pub use self::memory_store::InMemoryTaskStore;
