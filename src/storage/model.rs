// Storage-agnostic schema: static field descriptors per metric kind -> Model.
// Drivers materialize a Model in their own physical format.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{debug, info};

use crate::metrics::MetricDefinition;
use crate::source::Scope;
use crate::time_bucket::Granularity;

/// Schema derivation failure. Fatal for the offending model at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("model {model}: invalid identifier '{name}'")]
    InvalidName { model: String, name: String },
    #[error("model {model}: column '{column}' declared twice")]
    DuplicateColumn { model: String, column: String },
    #[error("model {model}: text column '{column}' needs a length")]
    MissingLength { model: String, column: String },
    #[error("model {model}: index '{index}' references unknown column '{column}'")]
    UnknownIndexColumn {
        model: String,
        index: String,
        column: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Long,
    Text,
}

/// Declares a composite index led by the field it is attached to.
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub with_columns: &'static [&'static str],
}

/// One declared storage field of a metric kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub searchable: bool,
    pub storage_only: bool,
    pub is_value: bool,
    pub length: usize,
    pub indices: &'static [IndexDef],
}

impl FieldDef {
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            searchable: false,
            storage_only: false,
            is_value: false,
            length: 0,
            indices: &[],
        }
    }

    pub const fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub const fn storage_only(mut self) -> Self {
        self.storage_only = true;
        self
    }

    pub const fn value(mut self) -> Self {
        self.is_value = true;
        self
    }

    pub const fn length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub const fn indexed(mut self, indices: &'static [IndexDef]) -> Self {
        self.indices = indices;
        self
    }
}

/// Field table of one kind; `parent` holds the fields it inherits.
#[derive(Debug)]
pub struct FieldTable {
    pub name: &'static str,
    pub fields: &'static [FieldDef],
    pub parent: Option<&'static FieldTable>,
}

pub const ENTITY_ID: &str = "entity_id";
pub const TIME_BUCKET: &str = "time_bucket";
pub const SOURCE_ID: &str = "source_id";
pub const DEST_ID: &str = "dest_id";
pub const COMPONENT_ID: &str = "component_id";

/// Columns every metric model carries.
pub static METRICS_BASE: FieldTable = FieldTable {
    name: "metrics",
    fields: &[
        FieldDef::new(ENTITY_ID, ColumnType::Text).searchable().length(512),
        FieldDef::new(TIME_BUCKET, ColumnType::Long)
            .searchable()
            .indexed(&[IndexDef {
                name: "time_bucket_entity",
                with_columns: &[ENTITY_ID],
            }]),
    ],
    parent: None,
};

/// Extra columns of relation scopes, read back by topology queries.
pub static RELATION_FIELDS: FieldTable = FieldTable {
    name: "relation",
    fields: &[
        FieldDef::new(SOURCE_ID, ColumnType::Text)
            .searchable()
            .length(512)
            .indexed(&[IndexDef {
                name: "relation_source",
                with_columns: &[TIME_BUCKET],
            }]),
        FieldDef::new(DEST_ID, ColumnType::Text)
            .searchable()
            .length(512)
            .indexed(&[IndexDef {
                name: "relation_dest",
                with_columns: &[TIME_BUCKET],
            }]),
        FieldDef::new(COMPONENT_ID, ColumnType::Int).storage_only(),
    ],
    parent: None,
};

/// Logical name plus the name used by the storage driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnName {
    pub logical: String,
    pub storage: String,
}

impl ColumnName {
    fn new(logical: &str) -> Self {
        Self {
            logical: logical.to_string(),
            storage: logical.to_string(),
        }
    }

    fn override_name(&mut self, old: &str, new: &str) {
        if self.storage == old {
            self.storage = new.to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelColumn {
    pub name: ColumnName,
    pub column_type: ColumnType,
    pub searchable: bool,
    pub storage_only: bool,
    pub is_value: bool,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtraQueryIndex {
    pub name: String,
    /// Storage column names, leading column first.
    pub columns: Vec<String>,
}

impl ExtraQueryIndex {
    fn override_name(&mut self, old: &str, new: &str) {
        for column in &mut self.columns {
            if column == old {
                *column = new.to_string();
            }
        }
    }
}

/// Derived schema of one stored metric model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Model {
    pub name: String,
    pub metric: String,
    pub scope: Scope,
    pub granularity: Granularity,
    pub columns: Vec<ModelColumn>,
    pub extra_indices: Vec<ExtraQueryIndex>,
    pub time_series: bool,
    pub delete_history: bool,
}

impl Model {
    pub fn column(&self, logical: &str) -> Option<&ModelColumn> {
        self.columns.iter().find(|c| c.name.logical == logical)
    }

    /// Storage-facing name of a logical column.
    pub fn storage_name(&self, logical: &str) -> Option<&str> {
        self.column(logical).map(|c| c.name.storage.as_str())
    }

    fn override_column_name(&mut self, old: &str, new: &str) {
        for column in &mut self.columns {
            column.name.override_name(old, new);
        }
        for index in &mut self.extra_indices {
            index.override_name(old, new);
        }
    }
}

/// Builds the model of `definition` at `granularity` from its field chain.
pub fn derive_model(
    definition: &MetricDefinition,
    granularity: Granularity,
) -> Result<Model, SchemaError> {
    let name = definition.model_name(granularity);
    validate_identifier(&name, &name)?;

    let mut columns: Vec<ModelColumn> = Vec::new();
    let mut declared_indices: Vec<(&'static str, IndexDef)> = Vec::new();
    let mut seen = HashSet::new();

    for table in definition.field_chain() {
        let mut current = Some(table);
        while let Some(t) = current {
            for field in t.fields {
                validate_identifier(&name, field.name)?;
                if !seen.insert(field.name) {
                    return Err(SchemaError::DuplicateColumn {
                        model: name,
                        column: field.name.to_string(),
                    });
                }
                if field.column_type == ColumnType::Text && field.length == 0 {
                    return Err(SchemaError::MissingLength {
                        model: name,
                        column: field.name.to_string(),
                    });
                }
                debug!(model = %name, column = field.name, table = t.name, "column derived");
                columns.push(ModelColumn {
                    name: ColumnName::new(field.name),
                    column_type: field.column_type,
                    searchable: field.searchable,
                    storage_only: field.storage_only,
                    is_value: field.is_value,
                    length: field.length,
                });
                declared_indices.extend(field.indices.iter().map(|idx| (field.name, *idx)));
            }
            current = t.parent;
        }
    }

    let mut extra_indices = Vec::with_capacity(declared_indices.len());
    for (main, index) in declared_indices {
        let index_name = format!("{name}_{}", index.name);
        validate_identifier(&name, &index_name)?;
        let mut index_columns = vec![main.to_string()];
        for with in index.with_columns {
            if !seen.contains(with) {
                return Err(SchemaError::UnknownIndexColumn {
                    model: name,
                    index: index.name.to_string(),
                    column: with.to_string(),
                });
            }
            index_columns.push(with.to_string());
        }
        extra_indices.push(ExtraQueryIndex {
            name: index_name,
            columns: index_columns,
        });
    }

    Ok(Model {
        metric: definition.name.clone(),
        scope: definition.scope,
        granularity,
        columns,
        extra_indices,
        time_series: true,
        delete_history: definition.delete_history,
        name,
    })
}

fn validate_identifier(model: &str, name: &str) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidName {
            model: model.to_string(),
            name: name.to_string(),
        })
    }
}

/// Registry of derived models.
///
/// Registration is serialized by a lock; lookups read a snapshot without locking.
#[derive(Default)]
pub struct StorageModels {
    models: ArcSwap<HashMap<String, Arc<Model>>>,
    registration: Mutex<Vec<(String, String)>>,
}

impl StorageModels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives and caches the model; a second registration of the same name
    /// returns the cached model unchanged.
    pub fn register(
        &self,
        definition: &MetricDefinition,
        granularity: Granularity,
    ) -> Result<Arc<Model>, SchemaError> {
        let overrides = self
            .registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let name = definition.model_name(granularity);
        if let Some(existing) = self.models.load().get(&name) {
            return Ok(existing.clone());
        }

        let mut model = derive_model(definition, granularity)?;
        for (old, new) in overrides.iter() {
            model.override_column_name(old, new);
        }
        let model = Arc::new(model);

        let mut next = HashMap::clone(&self.models.load());
        next.insert(name.clone(), model.clone());
        self.models.store(Arc::new(next));
        info!(model = %name, columns = model.columns.len(), "model registered");
        Ok(model)
    }

    /// Renames a storage column in every model and every extra index.
    ///
    /// Also applied to models registered later. Repeating it is a no-op.
    pub fn override_column_name(&self, old: &str, new: &str) -> Result<(), SchemaError> {
        validate_identifier("override", new)?;
        let mut overrides = self
            .registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if overrides.iter().any(|(o, n)| o == old && n == new) {
            return Ok(());
        }
        overrides.push((old.to_string(), new.to_string()));

        let next: HashMap<String, Arc<Model>> = self
            .models
            .load()
            .iter()
            .map(|(name, model)| {
                let mut model = Model::clone(model);
                model.override_column_name(old, new);
                (name.clone(), Arc::new(model))
            })
            .collect();
        self.models.store(Arc::new(next));
        info!(old, new, "column renamed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Model>> {
        self.models.load().get(name).cloned()
    }

    /// All models, ordered by name.
    pub fn all(&self) -> Vec<Arc<Model>> {
        let mut models: Vec<Arc<Model>> = self.models.load().values().cloned().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }
}
