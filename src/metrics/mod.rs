// Aggregate entities: mergeable, time-bucketed state of one metric for one
// dimension. The kind-specific state lives behind the closed MetricsValue enum.

pub mod apdex;
pub mod average;
pub mod codec;
pub mod dataset;
pub mod definition;
pub mod histogram;
pub mod percentile;
pub mod sum;

use std::sync::Arc;

use bytes::Bytes;

pub use apdex::Apdex;
pub use average::Average;
pub use codec::RemoteMetrics;
pub use dataset::{Dataset, DatasetEntry};
pub use definition::{
    EventFilter, Function, MetricContext, MetricDefinition, MetricRegistry, ValueSource,
    default_definitions,
};
pub use histogram::Histogram;
pub use percentile::Percentile;
pub use sum::Sum;

use crate::source::{MeterValue, RelationEnds, SourceEvent};
use crate::storage::Row;
use crate::storage::model::{
    COMPONENT_ID, DEST_ID, ENTITY_ID, FieldTable, Model, SOURCE_ID, TIME_BUCKET,
};
use crate::time_bucket::Granularity;
use codec::{ColumnReader, ColumnWriter};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("identity mismatch: expected {expected}, got {found}")]
    IdentityMismatch { expected: String, found: String },
    #[error("cannot merge {expected:?} with {found:?}")]
    KindMismatch { expected: Function, found: Function },
    #[error("bucket width mismatch: expected {expected}, got {found}")]
    IncompatibleBuckets { expected: i64, found: i64 },
    #[error("event not accepted by metric {0}")]
    EventRejected(String),
    #[error("unknown metric {0}")]
    UnknownMetric(String),
    #[error("metric {0} defined twice")]
    DuplicateDefinition(String),
    #[error("model {model} has no column {column}")]
    MissingColumn { model: String, column: String },
    #[error("column {column} has the wrong type")]
    ColumnType { column: String },
    #[error("invalid dataset entry '{0}'")]
    InvalidDataset(String),
    #[error("remote frame: {0}")]
    Remote(String),
    #[error("stage cannot move from {from:?} to {to:?}")]
    StageRegression { from: Stage, to: Stage },
}

/// Lifecycle of an entity through the pipeline. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Created,
    LocallyFolded,
    Routed,
    Persisted,
}

/// Behaviour every kind's raw state provides.
pub(crate) trait MetricKind: Sized {
    fn fields() -> &'static FieldTable;
    fn merge(&mut self, other: &Self) -> Result<(), MetricsError>;
    /// Refreshes derived values; raw counters stay untouched.
    fn calculate(&mut self);
    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError>;
    fn read_columns(r: &ColumnReader<'_>) -> Result<Self, MetricsError>;
    fn to_remote(&self, out: &mut RemoteMetrics);
    fn from_remote(remote: &RemoteMetrics) -> Result<Self, MetricsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsValue {
    Sum(Sum),
    Average(Average),
    Apdex(Apdex),
    Percentile(Percentile),
    Histogram(Histogram),
}

impl MetricsValue {
    pub fn function(&self) -> Function {
        match self {
            MetricsValue::Sum(_) => Function::Sum,
            MetricsValue::Average(_) => Function::Average,
            MetricsValue::Apdex(_) => Function::HealthIndex,
            MetricsValue::Percentile(_) => Function::Percentile,
            MetricsValue::Histogram(_) => Function::Histogram,
        }
    }

    fn merge(&mut self, other: &MetricsValue) -> Result<(), MetricsError> {
        match (self, other) {
            (MetricsValue::Sum(a), MetricsValue::Sum(b)) => a.merge(b),
            (MetricsValue::Average(a), MetricsValue::Average(b)) => a.merge(b),
            (MetricsValue::Apdex(a), MetricsValue::Apdex(b)) => a.merge(b),
            (MetricsValue::Percentile(a), MetricsValue::Percentile(b)) => a.merge(b),
            (MetricsValue::Histogram(a), MetricsValue::Histogram(b)) => a.merge(b),
            (a, b) => Err(MetricsError::KindMismatch {
                expected: a.function(),
                found: b.function(),
            }),
        }
    }

    fn calculate(&mut self) {
        match self {
            MetricsValue::Sum(v) => v.calculate(),
            MetricsValue::Average(v) => v.calculate(),
            MetricsValue::Apdex(v) => v.calculate(),
            MetricsValue::Percentile(v) => v.calculate(),
            MetricsValue::Histogram(v) => v.calculate(),
        }
    }

    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError> {
        match self {
            MetricsValue::Sum(v) => v.write_columns(w),
            MetricsValue::Average(v) => v.write_columns(w),
            MetricsValue::Apdex(v) => v.write_columns(w),
            MetricsValue::Percentile(v) => v.write_columns(w),
            MetricsValue::Histogram(v) => v.write_columns(w),
        }
    }

    fn to_remote(&self, out: &mut RemoteMetrics) {
        match self {
            MetricsValue::Sum(v) => v.to_remote(out),
            MetricsValue::Average(v) => v.to_remote(out),
            MetricsValue::Apdex(v) => v.to_remote(out),
            MetricsValue::Percentile(v) => v.to_remote(out),
            MetricsValue::Histogram(v) => v.to_remote(out),
        }
    }
}

/// One aggregate: a metric, a dimension, a time bucket and the running state.
#[derive(Debug, Clone)]
pub struct Metrics {
    definition: Arc<MetricDefinition>,
    granularity: Granularity,
    time_bucket: i64,
    entity_id: String,
    relation: RelationEnds,
    value: MetricsValue,
    stage: Stage,
}

impl Metrics {
    pub fn new(
        definition: Arc<MetricDefinition>,
        granularity: Granularity,
        time_bucket: i64,
        entity_id: String,
        relation: RelationEnds,
        value: MetricsValue,
    ) -> Self {
        Self {
            definition,
            granularity,
            time_bucket,
            entity_id,
            relation,
            value,
            stage: Stage::Created,
        }
    }

    pub fn definition(&self) -> &Arc<MetricDefinition> {
        &self.definition
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn relation(&self) -> &RelationEnds {
        &self.relation
    }

    pub fn value(&self) -> &MetricsValue {
        &self.value
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Storage id, unique within one model.
    pub fn id(&self) -> String {
        format!("{}_{}", self.time_bucket, self.entity_id)
    }

    pub fn model_name(&self) -> String {
        self.definition.model_name(self.granularity)
    }

    /// Globally unique identity; the key for sharding and routing.
    pub fn routing_key(&self) -> String {
        format!("{}/{}", self.model_name(), self.id())
    }

    pub fn advance(&mut self, next: Stage) -> Result<(), MetricsError> {
        if next <= self.stage {
            return Err(MetricsError::StageRegression {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }

    /// Folds one event of the same identity into the running state.
    pub fn combine_event(
        &mut self,
        event: &SourceEvent,
        context: &MetricContext,
    ) -> Result<(), MetricsError> {
        if !self.definition.accepts(event) {
            return Err(MetricsError::EventRejected(self.definition.name.clone()));
        }
        let bucket = context.allocator.bucket(event.timestamp, self.granularity);
        let entity_id = event.entity.entity_id();
        if bucket != self.time_bucket || entity_id != self.entity_id {
            return Err(MetricsError::IdentityMismatch {
                expected: self.id(),
                found: format!("{bucket}_{entity_id}"),
            });
        }

        let amount = match (self.definition.source, &event.meter) {
            (ValueSource::Count, _) => 1,
            (ValueSource::Latency, _) => event.latency,
            (ValueSource::MeterValue, Some(MeterValue::Single(v))) => *v,
            (ValueSource::MeterValue, _) => 0,
        };

        match &mut self.value {
            MetricsValue::Sum(sum) => sum.add(amount),
            MetricsValue::Average(avg) => avg.add(amount, 1),
            MetricsValue::Apdex(apdex) => {
                let threshold = context.dictionary.lookup_threshold(event.entity.name());
                apdex.observe(event.latency, threshold, !event.is_failure());
            }
            MetricsValue::Percentile(p) => p.observe(amount),
            MetricsValue::Histogram(h) => match &event.meter {
                Some(MeterValue::Histogram(buckets)) => h.observe_buckets(buckets),
                _ => h.observe(amount, context.histogram_buckets),
            },
        }
        Ok(())
    }

    /// Merges another entity of the same identity. Order of merges does not
    /// change the result.
    pub fn combine(&mut self, other: &Metrics) -> Result<(), MetricsError> {
        if self.definition.name != other.definition.name
            || self.granularity != other.granularity
            || self.time_bucket != other.time_bucket
            || self.entity_id != other.entity_id
        {
            return Err(MetricsError::IdentityMismatch {
                expected: self.routing_key(),
                found: other.routing_key(),
            });
        }
        self.value.merge(&other.value)?;
        if self.relation == RelationEnds::default() {
            self.relation = other.relation.clone();
        }
        Ok(())
    }

    /// Refreshes derived values. Idempotent.
    pub fn calculate(&mut self) {
        self.value.calculate();
    }

    pub fn to_hour(&self) -> Option<Metrics> {
        self.to_granularity(Granularity::Hour)
    }

    pub fn to_day(&self) -> Option<Metrics> {
        self.to_granularity(Granularity::Day)
    }

    pub fn to_month(&self) -> Option<Metrics> {
        self.to_granularity(Granularity::Month)
    }

    /// Same raw state under the coarser bucket; `None` when `to` is finer.
    pub fn to_granularity(&self, to: Granularity) -> Option<Metrics> {
        let time_bucket = self.granularity.downsample(self.time_bucket, to)?;
        Some(Metrics {
            definition: self.definition.clone(),
            granularity: to,
            time_bucket,
            entity_id: self.entity_id.clone(),
            relation: self.relation.clone(),
            value: self.value.clone(),
            stage: self.stage,
        })
    }

    /// Encodes through the storage column names of `model`.
    pub fn to_row(&self, model: &Model) -> Result<Row, MetricsError> {
        if model.metric != self.definition.name || model.granularity != self.granularity {
            return Err(MetricsError::IdentityMismatch {
                expected: model.name.clone(),
                found: self.model_name(),
            });
        }
        let mut w = ColumnWriter::new(model);
        w.text(ENTITY_ID, self.entity_id.clone())?;
        w.long(TIME_BUCKET, self.time_bucket)?;
        if model.scope.is_relation() {
            w.text(SOURCE_ID, self.relation.source_id.clone())?;
            w.text(DEST_ID, self.relation.dest_id.clone())?;
            w.long(COMPONENT_ID, i64::from(self.relation.component_id))?;
        }
        self.value.write_columns(&mut w)?;
        Ok(w.finish())
    }

    /// Wire form for cross-node transport; decoded by
    /// [`MetricRegistry::decode_remote`].
    pub fn encode_remote(&self) -> Result<Bytes, MetricsError> {
        let mut remote = RemoteMetrics {
            metric: self.definition.name.clone(),
            granularity: self.granularity,
            time_bucket: self.time_bucket,
            entity_id: self.entity_id.clone(),
            source_id: self.relation.source_id.clone(),
            dest_id: self.relation.dest_id.clone(),
            component_id: self.relation.component_id,
            ..Default::default()
        };
        self.value.to_remote(&mut remote);
        Ok(Bytes::from(remote.encode()?))
    }
}
