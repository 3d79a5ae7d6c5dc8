//! Resource record persistence.

mod memory;
mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::{ResourceRecord, ResourceState};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database failed.
    #[error("database error: {0}")]
    Database(String),

    /// A stored record could not be encoded or decoded.
    #[error("corrupt record {resource_id}: {detail}")]
    Corrupt { resource_id: String, detail: String },
}

/// Persistence for lifecycle records.
///
/// All writes go through compare-and-swap: `expected` names the state the
/// caller believes the record is in, with `None` meaning "no record
/// exists yet". A `false` return means another writer got there first;
/// the caller must re-read before retrying.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, resource_id: &str) -> Result<Option<ResourceRecord>, StoreError>;

    async fn compare_and_swap(
        &self,
        resource_id: &str,
        expected: Option<ResourceState>,
        record: ResourceRecord,
    ) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError>;
}
