// Percentile: latency bucketed by precision; rank values derived on calculate.

use super::codec::{ColumnReader, ColumnWriter, RemoteMetrics};
use super::dataset::{Dataset, DatasetEntry};
use super::{MetricKind, MetricsError};
use crate::storage::model::{ColumnType, FieldDef, FieldTable, METRICS_BASE};

pub const PRECISION: &str = "precision";
pub const DATASET: &str = "dataset";
pub const VALUE: &str = "value";

pub const RANKS: [u32; 5] = [50, 75, 90, 95, 99];

pub static PERCENTILE_FIELDS: FieldTable = FieldTable {
    name: "percentile",
    fields: &[
        FieldDef::new(PRECISION, ColumnType::Int).storage_only(),
        FieldDef::new(DATASET, ColumnType::Text)
            .storage_only()
            .length(1000),
        FieldDef::new(VALUE, ColumnType::Text).value().length(1000),
    ],
    parent: Some(&METRICS_BASE),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Percentile {
    precision: i64,
    dataset: Dataset,
    values: Vec<i64>,
}

impl Percentile {
    /// `precision` <= 0 is treated as 1.
    pub fn new(precision: i64) -> Self {
        Self {
            precision: precision.max(1),
            dataset: Dataset::new(),
            values: Vec::new(),
        }
    }

    pub fn observe(&mut self, latency: i64) {
        let bucket = latency.max(0) / self.precision * self.precision;
        self.dataset.add(bucket, 1);
    }

    pub fn precision(&self) -> i64 {
        self.precision
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Values for [`RANKS`], in that order. Empty until calculated.
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    fn values_text(&self) -> String {
        Dataset::from_entries(
            RANKS
                .iter()
                .zip(&self.values)
                .map(|(rank, value)| DatasetEntry {
                    bucket: i64::from(*rank),
                    count: *value,
                }),
        )
        .encode()
    }
}

impl MetricKind for Percentile {
    fn fields() -> &'static FieldTable {
        &PERCENTILE_FIELDS
    }

    fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        if self.precision != other.precision {
            return Err(MetricsError::IncompatibleBuckets {
                expected: self.precision,
                found: other.precision,
            });
        }
        self.dataset.merge(&other.dataset);
        Ok(())
    }

    fn calculate(&mut self) {
        self.values = RANKS
            .iter()
            .map(|rank| self.dataset.rank_bucket(*rank).unwrap_or(0))
            .collect();
    }

    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError> {
        w.long(PRECISION, self.precision)?;
        w.text(DATASET, self.dataset.encode())?;
        w.text(VALUE, self.values_text())
    }

    fn read_columns(r: &ColumnReader<'_>) -> Result<Self, MetricsError> {
        let values = Dataset::decode(r.text(VALUE)?)?
            .entries()
            .iter()
            .map(|e| e.count)
            .collect();
        Ok(Self {
            precision: r.long(PRECISION)?,
            dataset: Dataset::decode(r.text(DATASET)?)?,
            values,
        })
    }

    fn to_remote(&self, out: &mut RemoteMetrics) {
        out.longs = vec![self.precision];
        out.dataset = self.dataset.entries().to_vec();
    }

    fn from_remote(remote: &RemoteMetrics) -> Result<Self, MetricsError> {
        let [precision] = remote.longs::<1>("percentile")?;
        let mut percentile = Self::new(precision);
        percentile.dataset = Dataset::from_entries(remote.dataset.iter().copied());
        Ok(percentile)
    }
}
