// Histogram: fixed-step latency buckets, or agent-reported meter buckets.

use super::codec::{ColumnReader, ColumnWriter, RemoteMetrics};
use super::dataset::Dataset;
use super::{MetricKind, MetricsError};
use crate::source::MeterBucket;
use crate::storage::model::{ColumnType, FieldDef, FieldTable, METRICS_BASE};

pub const STEP: &str = "step";
pub const DATASET: &str = "dataset";

pub static HISTOGRAM_FIELDS: FieldTable = FieldTable {
    name: "histogram",
    fields: &[
        FieldDef::new(STEP, ColumnType::Int).storage_only(),
        FieldDef::new(DATASET, ColumnType::Text).value().length(1000),
    ],
    parent: Some(&METRICS_BASE),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    step: i64,
    dataset: Dataset,
}

impl Histogram {
    /// `step` <= 0 is treated as 1.
    pub fn new(step: i64) -> Self {
        Self {
            step: step.max(1),
            dataset: Dataset::new(),
        }
    }

    /// Adds one latency sample; samples beyond the last bucket land in it.
    pub fn observe(&mut self, latency: i64, buckets: u32) {
        let overflow = self.step.saturating_mul(i64::from(buckets.max(1) - 1));
        let bucket = (latency.max(0) / self.step * self.step).min(overflow);
        self.dataset.add(bucket, 1);
    }

    /// Adds pre-bucketed counts as reported by an agent.
    pub fn observe_buckets(&mut self, buckets: &[MeterBucket]) {
        for b in buckets {
            self.dataset.add(b.bucket, b.count);
        }
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Lower bound of the bucket holding the `rank` percentile.
    pub fn percentile(&self, rank: u32) -> Option<i64> {
        self.dataset.rank_bucket(rank)
    }
}

impl MetricKind for Histogram {
    fn fields() -> &'static FieldTable {
        &HISTOGRAM_FIELDS
    }

    fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        if self.step != other.step {
            return Err(MetricsError::IncompatibleBuckets {
                expected: self.step,
                found: other.step,
            });
        }
        self.dataset.merge(&other.dataset);
        Ok(())
    }

    fn calculate(&mut self) {}

    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError> {
        w.long(STEP, self.step)?;
        w.text(DATASET, self.dataset.encode())
    }

    fn read_columns(r: &ColumnReader<'_>) -> Result<Self, MetricsError> {
        Ok(Self {
            step: r.long(STEP)?,
            dataset: Dataset::decode(r.text(DATASET)?)?,
        })
    }

    fn to_remote(&self, out: &mut RemoteMetrics) {
        out.longs = vec![self.step];
        out.dataset = self.dataset.entries().to_vec();
    }

    fn from_remote(remote: &RemoteMetrics) -> Result<Self, MetricsError> {
        let [step] = remote.longs::<1>("histogram")?;
        let mut histogram = Self::new(step);
        histogram.dataset = Dataset::from_entries(remote.dataset.iter().copied());
        Ok(histogram)
    }
}
