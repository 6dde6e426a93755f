// Schema derivation and column-name override tests

mod common;

use std::sync::Arc;

use common::*;
use metricflow::metrics::{Function, MetricDefinition, ValueSource};
use metricflow::source::Scope;
use metricflow::storage::SchemaError;
use metricflow::storage::StorageModels;
use metricflow::storage::model::derive_model;
use metricflow::time_bucket::Granularity;

fn logical_columns(models: &StorageModels, name: &str) -> Vec<String> {
    models
        .get(name)
        .unwrap()
        .columns
        .iter()
        .map(|c| c.name.logical.clone())
        .collect()
}

#[test]
fn registration_is_idempotent() {
    let registry = registry();
    let models = StorageModels::new();
    let definition = registry.get("service_resp_time").unwrap();

    let first = models.register(definition, Granularity::Hour).unwrap();
    let second = models.register(definition, Granularity::Hour).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.name, "service_resp_time_hour");
    assert_eq!(
        logical_columns(&models, "service_resp_time_hour"),
        vec!["summation", "count", "value", "entity_id", "time_bucket"]
    );
    assert_eq!(first.extra_indices.len(), 1);
    assert_eq!(
        first.extra_indices[0].columns,
        vec!["time_bucket".to_string(), "entity_id".to_string()]
    );
}

#[test]
fn every_definition_gets_four_models() {
    let registry = registry();
    let models = models(&registry);
    assert_eq!(models.all().len(), registry.definitions().len() * 4);
    let month = models.get("endpoint_histogram_month").unwrap();
    assert_eq!(month.granularity, Granularity::Month);
    assert!(month.delete_history);
}

#[test]
fn relation_models_carry_both_ends() {
    let registry = registry();
    let models = models(&registry);
    let model = models.get("service_relation_server_cpm_day").unwrap();
    assert_eq!(
        logical_columns(&models, &model.name),
        vec![
            "source_id",
            "dest_id",
            "component_id",
            "value",
            "entity_id",
            "time_bucket"
        ]
    );
    let index_names: Vec<_> = model.extra_indices.iter().map(|i| i.name.as_str()).collect();
    assert!(index_names.contains(&"service_relation_server_cpm_day_relation_source"));
    assert!(index_names.contains(&"service_relation_server_cpm_day_relation_dest"));
}

#[test]
fn rename_updates_columns_and_indices() {
    let registry = registry();
    let models = models(&registry);
    models.override_column_name("time_bucket", "bucket_ts").unwrap();

    let model = models.get("service_cpm_minute").unwrap();
    assert_eq!(model.storage_name("time_bucket"), Some("bucket_ts"));
    assert_eq!(
        model.extra_indices[0].columns,
        vec!["bucket_ts".to_string(), "entity_id".to_string()]
    );
    let relation = models.get("endpoint_relation_cpm_minute").unwrap();
    assert!(
        relation
            .extra_indices
            .iter()
            .all(|i| !i.columns.contains(&"time_bucket".to_string()))
    );

    // Repeating the override changes nothing.
    let before = models.all();
    models.override_column_name("time_bucket", "bucket_ts").unwrap();
    assert_eq!(before, models.all());
}

#[test]
fn later_registrations_inherit_overrides() {
    let models = StorageModels::new();
    models.override_column_name("entity_id", "dimension").unwrap();
    let definition =
        MetricDefinition::new("gateway_cpm", Scope::Service, Function::Sum, ValueSource::Count);
    let model = models.register(&definition, Granularity::Minute).unwrap();
    assert_eq!(model.storage_name("entity_id"), Some("dimension"));
    assert_eq!(
        model.extra_indices[0].columns,
        vec!["time_bucket".to_string(), "dimension".to_string()]
    );
}

#[test]
fn invalid_identifiers_are_rejected() {
    let definition =
        MetricDefinition::new("Gateway-CPM", Scope::Service, Function::Sum, ValueSource::Count);
    assert!(matches!(
        derive_model(&definition, Granularity::Minute),
        Err(SchemaError::InvalidName { .. })
    ));

    let models = StorageModels::new();
    assert!(models.override_column_name("value", "1st").is_err());
}
