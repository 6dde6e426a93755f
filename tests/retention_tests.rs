// Retention pass and compaction schedule tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use common::*;
use metricflow::metrics::{Function, MetricDefinition, MetricRegistry, Metrics, ValueSource};
use metricflow::retention::{CompactSchedule, RetentionConfig, run_one_pass};
use metricflow::source::{Entity, Scope, SourceEvent};
use metricflow::storage::{MemoryStorage, StorageDriver, StorageModels};
use metricflow::time_bucket::{Granularity, TimeBucketAllocator};

const DAY_MS: i64 = 86_400_000;

fn retention() -> RetentionConfig {
    RetentionConfig {
        interval_secs: 60,
        minute_ttl_days: 1,
        hour_ttl_days: 7,
        day_ttl_days: 90,
        month_ttl_days: 730,
        compact_schedule: None,
        compact_interval_secs: 3600,
    }
}

fn event(timestamp: i64) -> SourceEvent {
    SourceEvent {
        entity: Entity::Service {
            name: "order".into(),
        },
        timestamp,
        latency: 1,
        status_code: Some(200),
        is_error: false,
        meter: None,
    }
}

async fn write(storage: &MemoryStorage, models: &StorageModels, m: &Metrics) {
    let model = models.get(&m.model_name()).unwrap();
    storage
        .write_by_identity(&model, &m.id(), m.to_row(&model).unwrap(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_buckets_are_deleted_per_granularity() {
    let mut registry = MetricRegistry::new(context());
    registry
        .register(MetricDefinition::new(
            "order_cpm",
            Scope::Service,
            Function::Sum,
            ValueSource::Count,
        ))
        .unwrap();
    registry
        .register(
            MetricDefinition::new(
                "order_cpm_kept",
                Scope::Service,
                Function::Sum,
                ValueSource::Count,
            )
            .keep_history(),
        )
        .unwrap();
    let registry = Arc::new(registry);
    let models = models(&registry);
    let storage = memory_storage(&models).await;

    for name in ["order_cpm", "order_cpm_kept"] {
        let definition = registry.get(name).unwrap().clone();
        for timestamp in [TS, TS + DAY_MS + DAY_MS / 2] {
            let minute = registry.create(&definition, &event(timestamp)).unwrap();
            write(&storage, &models, &minute).await;
            write(&storage, &models, &minute.to_hour().unwrap()).await;
        }
    }

    let deleted = run_one_pass(
        storage.as_ref(),
        &models,
        &TimeBucketAllocator::utc(),
        &retention(),
        TS + 2 * DAY_MS,
    )
    .await
    .unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(storage.len("order_cpm_minute").await, 1);
    assert_eq!(storage.len("order_cpm_hour").await, 2);
    assert_eq!(storage.len("order_cpm_kept_minute").await, 2);
}

#[test]
fn ttl_follows_granularity() {
    let config = retention();
    assert_eq!(config.ttl_days(Granularity::Minute), 1);
    assert_eq!(config.ttl_days(Granularity::Month), 730);
}

#[test]
fn cron_compaction_waits_for_next_slot() {
    let mut config = retention();
    config.compact_schedule = Some("0 0 3 * * *".into());
    let schedule = CompactSchedule::from_config(&config).unwrap();
    let now = chrono::Utc.with_ymd_and_hms(2019, 3, 14, 1, 30, 0).unwrap();
    assert_eq!(schedule.delay_from(&now), Duration::from_secs(90 * 60));

    config.compact_schedule = Some("every night".into());
    assert!(CompactSchedule::from_config(&config).is_err());
}

#[test]
fn fixed_interval_compaction_ignores_clock() {
    let schedule = CompactSchedule::from_config(&retention()).unwrap();
    let now = chrono::Utc.with_ymd_and_hms(2019, 3, 14, 1, 30, 0).unwrap();
    assert_eq!(schedule.delay_from(&now), Duration::from_secs(3600));
}

#[test]
fn memory_driver_skips_compaction() {
    assert!(!MemoryStorage::new().supports_compaction());
}
