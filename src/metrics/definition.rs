// Metric definitions and the registry that turns events, wire frames and
// stored rows into Metrics.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::codec::{ColumnReader, RemoteMetrics};
use super::{
    Apdex, Average, Histogram, MetricKind, Metrics, MetricsError, MetricsValue, Percentile, Sum,
};
use crate::collaborators::ThresholdDictionary;
use crate::source::{DetectPoint, MeterValue, RelationEnds, Scope, SourceEvent};
use crate::storage::Row;
use crate::storage::model::{
    COMPONENT_ID, DEST_ID, ENTITY_ID, FieldTable, Model, RELATION_FIELDS, SOURCE_ID, SchemaError,
    StorageModels, TIME_BUCKET,
};
use crate::time_bucket::{Granularity, TimeBucketAllocator};

/// Aggregation function of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Sum,
    Average,
    HealthIndex,
    Percentile,
    Histogram,
}

/// Which part of the event feeds the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// Every event counts 1.
    Count,
    Latency,
    MeterValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub detect_point: Option<DetectPoint>,
    pub errors_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    pub name: String,
    pub scope: Scope,
    pub function: Function,
    pub source: ValueSource,
    pub filter: EventFilter,
    pub delete_history: bool,
}

impl MetricDefinition {
    pub fn new(name: &str, scope: Scope, function: Function, source: ValueSource) -> Self {
        Self {
            name: name.to_string(),
            scope,
            function,
            source,
            filter: EventFilter::default(),
            delete_history: true,
        }
    }

    pub fn detect_point(mut self, detect_point: DetectPoint) -> Self {
        self.filter.detect_point = Some(detect_point);
        self
    }

    pub fn errors_only(mut self) -> Self {
        self.filter.errors_only = true;
        self
    }

    pub fn keep_history(mut self) -> Self {
        self.delete_history = false;
        self
    }

    pub fn model_name(&self, granularity: Granularity) -> String {
        format!("{}_{}", self.name, granularity.suffix())
    }

    /// Field tables, most specific first; each table links to its parents.
    pub fn field_chain(&self) -> Vec<&'static FieldTable> {
        let kind = match self.function {
            Function::Sum => Sum::fields(),
            Function::Average => Average::fields(),
            Function::HealthIndex => Apdex::fields(),
            Function::Percentile => Percentile::fields(),
            Function::Histogram => Histogram::fields(),
        };
        if self.scope.is_relation() {
            vec![&RELATION_FIELDS, kind]
        } else {
            vec![kind]
        }
    }

    /// Whether `event` feeds this metric.
    pub fn accepts(&self, event: &SourceEvent) -> bool {
        if event.scope() != self.scope {
            return false;
        }
        if let Some(dp) = self.filter.detect_point
            && event.entity.detect_point() != Some(dp)
        {
            return false;
        }
        if self.filter.errors_only && !event.is_failure() {
            return false;
        }
        match (self.source, &event.meter) {
            (ValueSource::MeterValue, None) => false,
            (ValueSource::MeterValue, Some(MeterValue::Histogram(_))) => {
                self.function == Function::Histogram
            }
            (ValueSource::MeterValue, Some(MeterValue::Single(_))) => {
                self.function != Function::Histogram
            }
            _ => true,
        }
    }

    fn empty_value(&self, context: &MetricContext) -> MetricsValue {
        match self.function {
            Function::Sum => MetricsValue::Sum(Sum::default()),
            Function::Average => MetricsValue::Average(Average::default()),
            Function::HealthIndex => MetricsValue::Apdex(Apdex::default()),
            Function::Percentile => {
                MetricsValue::Percentile(Percentile::new(context.percentile_precision))
            }
            Function::Histogram => {
                let step = match self.source {
                    ValueSource::MeterValue => 1,
                    _ => context.histogram_step,
                };
                MetricsValue::Histogram(Histogram::new(step))
            }
        }
    }
}

/// Shared inputs of event folding.
#[derive(Clone)]
pub struct MetricContext {
    pub dictionary: Arc<dyn ThresholdDictionary>,
    pub allocator: TimeBucketAllocator,
    pub percentile_precision: i64,
    pub histogram_step: i64,
    pub histogram_buckets: u32,
}

impl MetricContext {
    pub fn new(dictionary: Arc<dyn ThresholdDictionary>, allocator: TimeBucketAllocator) -> Self {
        Self {
            dictionary,
            allocator,
            percentile_precision: 10,
            histogram_step: 100,
            histogram_buckets: 20,
        }
    }
}

impl std::fmt::Debug for MetricContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricContext")
            .field("allocator", &self.allocator)
            .field("percentile_precision", &self.percentile_precision)
            .field("histogram_step", &self.histogram_step)
            .field("histogram_buckets", &self.histogram_buckets)
            .finish_non_exhaustive()
    }
}

/// The definitions in force plus the context to fold events with.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    definitions: Vec<Arc<MetricDefinition>>,
    by_name: HashMap<String, Arc<MetricDefinition>>,
    context: MetricContext,
}

impl MetricRegistry {
    pub fn new(context: MetricContext) -> Self {
        Self {
            definitions: Vec::new(),
            by_name: HashMap::new(),
            context,
        }
    }

    pub fn with_defaults(context: MetricContext) -> Result<Self, MetricsError> {
        let mut registry = Self::new(context);
        for definition in default_definitions() {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: MetricDefinition) -> Result<(), MetricsError> {
        if self.by_name.contains_key(&definition.name) {
            return Err(MetricsError::DuplicateDefinition(definition.name));
        }
        let definition = Arc::new(definition);
        self.by_name
            .insert(definition.name.clone(), definition.clone());
        self.definitions.push(definition);
        Ok(())
    }

    pub fn definitions(&self) -> &[Arc<MetricDefinition>] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MetricDefinition>> {
        self.by_name.get(name)
    }

    pub fn context(&self) -> &MetricContext {
        &self.context
    }

    /// Registers every definition at every granularity.
    pub fn register_models(&self, models: &StorageModels) -> Result<Vec<Arc<Model>>, SchemaError> {
        let mut registered = Vec::with_capacity(self.definitions.len() * Granularity::ALL.len());
        for definition in &self.definitions {
            for granularity in Granularity::ALL {
                registered.push(models.register(definition, granularity)?);
            }
        }
        Ok(registered)
    }

    /// Minute entities for every definition that accepts `event`.
    pub fn build(&self, event: &SourceEvent) -> Vec<Metrics> {
        let mut built = Vec::new();
        for definition in self.definitions.iter().filter(|d| d.accepts(event)) {
            match self.create(definition, event) {
                Ok(metrics) => built.push(metrics),
                Err(e) => debug!(error = %e, metric = %definition.name, "event not folded"),
            }
        }
        built
    }

    /// A minute entity of `definition` holding exactly `event`.
    pub fn create(
        &self,
        definition: &Arc<MetricDefinition>,
        event: &SourceEvent,
    ) -> Result<Metrics, MetricsError> {
        let time_bucket = self
            .context
            .allocator
            .bucket(event.timestamp, Granularity::Minute);
        let mut metrics = Metrics::new(
            definition.clone(),
            Granularity::Minute,
            time_bucket,
            event.entity.entity_id(),
            event.entity.relation().unwrap_or_default(),
            definition.empty_value(&self.context),
        );
        metrics.combine_event(event, &self.context)?;
        Ok(metrics)
    }

    pub fn decode_remote(&self, bytes: &[u8]) -> Result<Metrics, MetricsError> {
        let remote = RemoteMetrics::decode(bytes)?;
        let definition = self
            .get(&remote.metric)
            .ok_or_else(|| MetricsError::UnknownMetric(remote.metric.clone()))?
            .clone();
        let value = match definition.function {
            Function::Sum => MetricsValue::Sum(Sum::from_remote(&remote)?),
            Function::Average => MetricsValue::Average(Average::from_remote(&remote)?),
            Function::HealthIndex => MetricsValue::Apdex(Apdex::from_remote(&remote)?),
            Function::Percentile => MetricsValue::Percentile(Percentile::from_remote(&remote)?),
            Function::Histogram => MetricsValue::Histogram(Histogram::from_remote(&remote)?),
        };
        Ok(Metrics::new(
            definition,
            remote.granularity,
            remote.time_bucket,
            remote.entity_id,
            RelationEnds {
                source_id: remote.source_id,
                dest_id: remote.dest_id,
                component_id: remote.component_id,
            },
            value,
        ))
    }

    pub fn decode_row(&self, model: &Model, row: &Row) -> Result<Metrics, MetricsError> {
        let definition = self
            .get(&model.metric)
            .ok_or_else(|| MetricsError::UnknownMetric(model.metric.clone()))?
            .clone();
        let r = ColumnReader::new(model, row);
        let value = match definition.function {
            Function::Sum => MetricsValue::Sum(Sum::read_columns(&r)?),
            Function::Average => MetricsValue::Average(Average::read_columns(&r)?),
            Function::HealthIndex => MetricsValue::Apdex(Apdex::read_columns(&r)?),
            Function::Percentile => MetricsValue::Percentile(Percentile::read_columns(&r)?),
            Function::Histogram => MetricsValue::Histogram(Histogram::read_columns(&r)?),
        };
        let relation = if model.scope.is_relation() {
            RelationEnds {
                source_id: r.text(SOURCE_ID)?.to_string(),
                dest_id: r.text(DEST_ID)?.to_string(),
                component_id: i32::try_from(r.long(COMPONENT_ID)?).map_err(|_| {
                    MetricsError::ColumnType {
                        column: COMPONENT_ID.to_string(),
                    }
                })?,
            }
        } else {
            RelationEnds::default()
        };
        Ok(Metrics::new(
            definition,
            model.granularity,
            r.long(TIME_BUCKET)?,
            r.text(ENTITY_ID)?.to_string(),
            relation,
            value,
        ))
    }
}

/// Built-in metric set.
pub fn default_definitions() -> Vec<MetricDefinition> {
    use Function as F;
    use ValueSource as V;
    vec![
        MetricDefinition::new("service_cpm", Scope::Service, F::Sum, V::Count),
        MetricDefinition::new("service_resp_time", Scope::Service, F::Average, V::Latency),
        MetricDefinition::new("service_apdex", Scope::Service, F::HealthIndex, V::Latency),
        MetricDefinition::new("service_percentile", Scope::Service, F::Percentile, V::Latency),
        MetricDefinition::new("service_error_cpm", Scope::Service, F::Sum, V::Count).errors_only(),
        MetricDefinition::new("service_instance_cpm", Scope::ServiceInstance, F::Sum, V::Count),
        MetricDefinition::new(
            "service_instance_resp_time",
            Scope::ServiceInstance,
            F::Average,
            V::Latency,
        ),
        MetricDefinition::new("endpoint_cpm", Scope::Endpoint, F::Sum, V::Count),
        MetricDefinition::new("endpoint_avg", Scope::Endpoint, F::Average, V::Latency),
        MetricDefinition::new("endpoint_percentile", Scope::Endpoint, F::Percentile, V::Latency),
        MetricDefinition::new("endpoint_histogram", Scope::Endpoint, F::Histogram, V::Latency),
        MetricDefinition::new(
            "service_relation_client_cpm",
            Scope::ServiceRelation,
            F::Sum,
            V::Count,
        )
        .detect_point(DetectPoint::Client),
        MetricDefinition::new(
            "service_relation_server_cpm",
            Scope::ServiceRelation,
            F::Sum,
            V::Count,
        )
        .detect_point(DetectPoint::Server),
        MetricDefinition::new("endpoint_relation_cpm", Scope::EndpointRelation, F::Sum, V::Count)
            .detect_point(DetectPoint::Server),
        MetricDefinition::new("meter_avg", Scope::Meter, F::Average, V::MeterValue),
        MetricDefinition::new("meter_histogram", Scope::Meter, F::Histogram, V::MeterValue),
    ]
}
