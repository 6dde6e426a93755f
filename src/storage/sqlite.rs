// SQLite driver: one table per model, `id` primary key plus an optimistic
// `version` column. Identifiers come from validated models.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::Row as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, instrument};

use super::model::{ColumnType, Model, TIME_BUCKET};
use super::{ColumnValue, Row, StorageDriver, StorageError, StoredRow, WriteOutcome};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(path: &str, max_connections: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    fn time_bucket_column(model: &Model) -> Result<&str, StorageError> {
        model
            .storage_name(TIME_BUCKET)
            .ok_or_else(|| StorageError::UnknownModel(model.name.clone()))
    }

    fn parse_row(model: &Model, row: &SqliteRow) -> Result<Row, StorageError> {
        let mut out = Row::new();
        for column in &model.columns {
            let name = column.name.storage.as_str();
            let value = match column.column_type {
                ColumnType::Int | ColumnType::Long => row
                    .try_get::<Option<i64>, _>(name)?
                    .map(ColumnValue::Long),
                ColumnType::Text => row
                    .try_get::<Option<String>, _>(name)?
                    .map(ColumnValue::Text),
            };
            if let Some(value) = value {
                out.insert(name, value);
            }
        }
        Ok(out)
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int | ColumnType::Long => "INTEGER",
        ColumnType::Text => "TEXT",
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_value<'q>(
    query: SqliteQuery<'q>,
    column_type: ColumnType,
    value: Option<&ColumnValue>,
) -> SqliteQuery<'q> {
    match (column_type, value) {
        (_, Some(ColumnValue::Long(v))) => query.bind(*v),
        (_, Some(ColumnValue::Text(t))) => query.bind(t.clone()),
        (ColumnType::Text, None) => query.bind(None::<String>),
        (_, None) => query.bind(None::<i64>),
    }
}

#[async_trait]
impl StorageDriver for SqliteStorage {
    #[instrument(skip(self, model), fields(repo = "sqlite", operation = "ensure_schema", model = %model.name))]
    async fn ensure_schema(&self, model: &Model) -> Result<(), StorageError> {
        let columns: Vec<String> = model
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name.storage, sql_type(c.column_type)))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (id TEXT PRIMARY KEY, version INTEGER NOT NULL, {})",
            model.name,
            columns.join(", ")
        );
        sqlx::query(&sql).execute(&self.pool).await?;

        for index in &model.extra_indices {
            let columns: Vec<String> = index.columns.iter().map(|c| format!("\"{c}\"")).collect();
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
                index.name,
                model.name,
                columns.join(", ")
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        debug!(model = %model.name, indices = model.extra_indices.len(), "schema ensured");
        Ok(())
    }

    async fn load_by_identity(
        &self,
        model: &Model,
        id: &str,
    ) -> Result<Option<StoredRow>, StorageError> {
        let sql = format!("SELECT * FROM \"{}\" WHERE id = $1", model.name);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.try_get("version")?;
        Ok(Some(StoredRow {
            row: Self::parse_row(model, &row)?,
            version: version as u64,
        }))
    }

    #[instrument(skip(self, model, row), fields(repo = "sqlite", operation = "write_by_identity", model = %model.name))]
    async fn write_by_identity(
        &self,
        model: &Model,
        id: &str,
        row: Row,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StorageError> {
        let names: Vec<String> = model
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name.storage))
            .collect();

        let result = match expected_version {
            None => {
                let placeholders: Vec<String> =
                    (0..names.len()).map(|i| format!("${}", i + 2)).collect();
                let sql = format!(
                    "INSERT INTO \"{}\" (id, version, {}) VALUES ($1, 1, {}) ON CONFLICT(id) DO NOTHING",
                    model.name,
                    names.join(", "),
                    placeholders.join(", ")
                );
                let mut query = sqlx::query(&sql).bind(id.to_string());
                for column in &model.columns {
                    query = bind_value(query, column.column_type, row.get(&column.name.storage));
                }
                query.execute(&self.pool).await?
            }
            Some(version) => {
                let assignments: Vec<String> = names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| format!("{name} = ${}", i + 1))
                    .collect();
                let n = names.len();
                let sql = format!(
                    "UPDATE \"{}\" SET version = version + 1, {} WHERE id = ${} AND version = ${}",
                    model.name,
                    assignments.join(", "),
                    n + 1,
                    n + 2
                );
                let mut query = sqlx::query(&sql);
                for column in &model.columns {
                    query = bind_value(query, column.column_type, row.get(&column.name.storage));
                }
                query
                    .bind(id.to_string())
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            Ok(WriteOutcome::VersionConflict)
        } else {
            Ok(WriteOutcome::Written)
        }
    }

    #[instrument(skip(self, model), fields(repo = "sqlite", operation = "scan_time_range", model = %model.name))]
    async fn scan_time_range(
        &self,
        model: &Model,
        start: i64,
        end: i64,
    ) -> Result<Vec<Row>, StorageError> {
        let bucket = Self::time_bucket_column(model)?;
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{bucket}\" >= $1 AND \"{bucket}\" <= $2 ORDER BY \"{bucket}\", id",
            model.name
        );
        let rows = sqlx::query(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| Self::parse_row(model, r)).collect()
    }

    #[instrument(skip(self, model), fields(repo = "sqlite", operation = "delete_before", model = %model.name))]
    async fn delete_before(&self, model: &Model, bucket: i64) -> Result<u64, StorageError> {
        let column = Self::time_bucket_column(model)?;
        let sql = format!("DELETE FROM \"{}\" WHERE \"{column}\" < $1", model.name);
        let r = sqlx::query(&sql).bind(bucket).execute(&self.pool).await?;
        Ok(r.rows_affected())
    }

    fn supports_compaction(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(repo = "sqlite", operation = "compact"))]
    async fn compact(&self) -> Result<(), StorageError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}
