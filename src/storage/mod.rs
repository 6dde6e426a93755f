// Storage driver seam. Drivers persist rows of a Model by identity with an
// optimistic version; the schema itself comes from storage::model.

pub mod memory;
pub mod model;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use memory::MemoryStorage;
pub use model::{Model, SchemaError, StorageModels};
pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("model {0} has no table")]
    UnknownModel(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Long(i64),
    Text(String),
}

/// One stored record, keyed by storage column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: BTreeMap<String, ColumnValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: &str, value: ColumnValue) {
        self.values.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ColumnValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A row plus the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub row: Row,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The stored version moved since the caller read it.
    VersionConflict,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Creates the physical table and indices of `model` if missing.
    async fn ensure_schema(&self, model: &Model) -> Result<(), StorageError>;

    async fn load_by_identity(
        &self,
        model: &Model,
        id: &str,
    ) -> Result<Option<StoredRow>, StorageError>;

    /// `expected_version` is `None` for an insert and the read version for an
    /// update.
    async fn write_by_identity(
        &self,
        model: &Model,
        id: &str,
        row: Row,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StorageError>;

    /// Rows with `start <= time_bucket <= end`.
    async fn scan_time_range(
        &self,
        model: &Model,
        start: i64,
        end: i64,
    ) -> Result<Vec<Row>, StorageError>;

    /// Deletes rows with `time_bucket < bucket`; returns the count.
    async fn delete_before(&self, model: &Model, bucket: i64) -> Result<u64, StorageError>;

    /// Whether `compact` reclaims anything; retention skips scheduling it otherwise.
    fn supports_compaction(&self) -> bool {
        false
    }

    async fn compact(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
