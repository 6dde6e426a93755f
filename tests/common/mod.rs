// Shared test helpers
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metricflow::collaborators::{ErrorReporter, StaticThresholds};
use metricflow::metrics::{MetricContext, MetricRegistry, Stage};
use metricflow::source::{
    DecodedRecord, SegmentRecord, SegmentReference, SpanKind, SpanRecord,
};
use metricflow::storage::{
    MemoryStorage, Model, Row, StorageDriver, StorageError, StorageModels, StoredRow,
    WriteOutcome,
};
use metricflow::time_bucket::TimeBucketAllocator;

/// 2019-03-14 09:26:53.589 UTC
pub const TS: i64 = 1_552_555_613_589;
pub const MINUTE: i64 = 201903140926;
pub const HOUR: i64 = 2019031409;
pub const DAY: i64 = 20190314;
pub const MONTH: i64 = 201903;

pub fn context() -> MetricContext {
    let thresholds = HashMap::from([("foo".to_string(), 500)]);
    MetricContext::new(
        Arc::new(StaticThresholds::new(1000, thresholds)),
        TimeBucketAllocator::utc(),
    )
}

pub fn registry() -> Arc<MetricRegistry> {
    Arc::new(MetricRegistry::with_defaults(context()).unwrap())
}

pub fn models(registry: &MetricRegistry) -> Arc<StorageModels> {
    let models = Arc::new(StorageModels::new());
    registry.register_models(&models).unwrap();
    models
}

pub async fn memory_storage(models: &StorageModels) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    for model in models.all() {
        storage.ensure_schema(&model).await.unwrap();
    }
    storage
}

pub fn span(span_id: i32, kind: SpanKind, op: &str, start: i64, latency: i64) -> SpanRecord {
    SpanRecord {
        span_id,
        parent_span_id: -1,
        kind,
        operation_name: op.into(),
        start_time: start,
        end_time: start + latency,
        is_error: false,
        status_code: Some(200),
        component_id: 1,
        peer: None,
        refs: vec![],
    }
}

pub fn segment(service: &str, spans: Vec<SpanRecord>) -> DecodedRecord {
    DecodedRecord::Segment(SegmentRecord {
        trace_id: "trace-1".into(),
        segment_id: format!("{service}-segment"),
        service: service.into(),
        service_instance: format!("{service}-1"),
        spans,
    })
}

/// Entry span on `endpoint` of `service`, called by `caller` (or the user).
pub fn entry_segment(
    service: &str,
    endpoint: &str,
    caller: Option<&str>,
    start: i64,
    latency: i64,
) -> DecodedRecord {
    let mut entry = span(0, SpanKind::Entry, endpoint, start, latency);
    if let Some(caller) = caller {
        entry.refs = vec![SegmentReference {
            parent_service: caller.into(),
            parent_service_instance: format!("{caller}-1"),
            parent_endpoint: "/call".into(),
            network_address: format!("{service}:8080"),
        }];
    }
    segment(service, vec![entry])
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    failures: Mutex<Vec<(Stage, String)>>,
}

impl RecordingReporter {
    pub fn failures(&self) -> Vec<(Stage, String)> {
        self.failures.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report_failure(&self, stage: Stage, identity: &str, _cause: &dyn std::error::Error) {
        self.failures
            .lock()
            .unwrap()
            .push((stage, identity.to_string()));
    }
}

/// Memory storage that fails, conflicts or loses the acknowledgement of the
/// first writes it sees.
#[derive(Debug, Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    fail_writes: AtomicU32,
    conflicts: AtomicU32,
    lost_acks: AtomicU32,
    pub writes: AtomicU32,
}

impl FlakyStorage {
    pub fn failing(n: u32) -> Self {
        Self {
            fail_writes: AtomicU32::new(n),
            ..Default::default()
        }
    }

    pub fn conflicting(n: u32) -> Self {
        Self {
            conflicts: AtomicU32::new(n),
            ..Default::default()
        }
    }

    /// The first `n` writes are committed but still answer with an error.
    pub fn losing_acks(n: u32) -> Self {
        Self {
            lost_acks: AtomicU32::new(n),
            ..Default::default()
        }
    }

    pub fn lose_next_acks(&self, n: u32) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl StorageDriver for FlakyStorage {
    async fn ensure_schema(&self, model: &Model) -> Result<(), StorageError> {
        self.inner.ensure_schema(model).await
    }

    async fn load_by_identity(
        &self,
        model: &Model,
        id: &str,
    ) -> Result<Option<StoredRow>, StorageError> {
        self.inner.load_by_identity(model, id).await
    }

    async fn write_by_identity(
        &self,
        model: &Model,
        id: &str,
        row: Row,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_writes) {
            return Err(StorageError::Unavailable("injected".into()));
        }
        if take_one(&self.conflicts) {
            return Ok(WriteOutcome::VersionConflict);
        }
        let outcome = self
            .inner
            .write_by_identity(model, id, row, expected_version)
            .await?;
        if outcome == WriteOutcome::Written && take_one(&self.lost_acks) {
            return Err(StorageError::Unavailable("connection reset".into()));
        }
        Ok(outcome)
    }

    async fn scan_time_range(
        &self,
        model: &Model,
        start: i64,
        end: i64,
    ) -> Result<Vec<Row>, StorageError> {
        self.inner.scan_time_range(model, start, end).await
    }

    async fn delete_before(&self, model: &Model, bucket: i64) -> Result<u64, StorageError> {
        self.inner.delete_before(model, bucket).await
    }
}
