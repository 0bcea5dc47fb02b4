//! Durable storage for the hub
//!
//! Each owning component gets a keyed on-disk map (`KvTable`) with atomic
//! insert/lookup/delete and a fold for startup index rebuilds. Records are
//! JSON blobs keyed by primary id. There are no cross-table transactions;
//! consistency comes from persist-then-publish sequencing and generation
//! fencing at the callers.

mod database;
mod kv;

pub use database::{Database, StorageError, StorageResult, table};
pub use kv::KvTable;
