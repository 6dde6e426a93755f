// In-process driver: one map per model. Used by tests and when no database
// path is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use super::model::{Model, TIME_BUCKET};
use super::{ColumnValue, Row, StorageDriver, StorageError, StoredRow, WriteOutcome};

type Table = HashMap<String, StoredRow>;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored for `model`.
    pub async fn len(&self, model: &str) -> usize {
        self.tables.read().await.get(model).map_or(0, |t| t.len())
    }
}

fn time_bucket(model: &Model, row: &Row) -> Option<i64> {
    let column = model.storage_name(TIME_BUCKET)?;
    match row.get(column)? {
        ColumnValue::Long(v) => Some(*v),
        ColumnValue::Text(_) => None,
    }
}

#[async_trait]
impl StorageDriver for MemoryStorage {
    async fn ensure_schema(&self, model: &Model) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .entry(model.name.clone())
            .or_default();
        Ok(())
    }

    async fn load_by_identity(
        &self,
        model: &Model,
        id: &str,
    ) -> Result<Option<StoredRow>, StorageError> {
        let tables = self.tables.read().await;
        let table = tables
            .get(&model.name)
            .ok_or_else(|| StorageError::UnknownModel(model.name.clone()))?;
        Ok(table.get(id).cloned())
    }

    #[instrument(skip(self, model, row), fields(repo = "memory", operation = "write_by_identity", model = %model.name))]
    async fn write_by_identity(
        &self,
        model: &Model,
        id: &str,
        row: Row,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StorageError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(&model.name)
            .ok_or_else(|| StorageError::UnknownModel(model.name.clone()))?;
        let current = table.get(id).map(|stored| stored.version);
        let version = match (current, expected_version) {
            (None, None) => 1,
            (Some(cur), Some(expected)) if cur == expected => cur + 1,
            _ => return Ok(WriteOutcome::VersionConflict),
        };
        table.insert(id.to_string(), StoredRow { row, version });
        Ok(WriteOutcome::Written)
    }

    async fn scan_time_range(
        &self,
        model: &Model,
        start: i64,
        end: i64,
    ) -> Result<Vec<Row>, StorageError> {
        let tables = self.tables.read().await;
        let Some(table) = tables.get(&model.name) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<(i64, &str, &Row)> = table
            .iter()
            .filter_map(|(id, stored)| {
                let bucket = time_bucket(model, &stored.row)?;
                (start..=end)
                    .contains(&bucket)
                    .then_some((bucket, id.as_str(), &stored.row))
            })
            .collect();
        rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(rows.into_iter().map(|(_, _, row)| row.clone()).collect())
    }

    #[instrument(skip(self, model), fields(repo = "memory", operation = "delete_before", model = %model.name))]
    async fn delete_before(&self, model: &Model, bucket: i64) -> Result<u64, StorageError> {
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(&model.name) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|_, stored| time_bucket(model, &stored.row).is_none_or(|b| b >= bucket));
        Ok((before - table.len()) as u64)
    }
}
