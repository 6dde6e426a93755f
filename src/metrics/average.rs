// Average: running (summation, count); value derived on calculate.

use super::codec::{ColumnReader, ColumnWriter, RemoteMetrics};
use super::{MetricKind, MetricsError};
use crate::storage::model::{ColumnType, FieldDef, FieldTable, METRICS_BASE};

pub const SUMMATION: &str = "summation";
pub const COUNT: &str = "count";
pub const VALUE: &str = "value";

pub static AVERAGE_FIELDS: FieldTable = FieldTable {
    name: "average",
    fields: &[
        FieldDef::new(SUMMATION, ColumnType::Long).storage_only(),
        FieldDef::new(COUNT, ColumnType::Long).storage_only(),
        FieldDef::new(VALUE, ColumnType::Long).value(),
    ],
    parent: Some(&METRICS_BASE),
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Average {
    summation: i64,
    count: i64,
    value: i64,
}

impl Average {
    pub fn add(&mut self, summation: i64, count: i64) {
        self.summation = self.summation.saturating_add(summation);
        self.count = self.count.saturating_add(count);
    }

    pub fn summation(&self) -> i64 {
        self.summation
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    /// Last calculated mean.
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl MetricKind for Average {
    fn fields() -> &'static FieldTable {
        &AVERAGE_FIELDS
    }

    fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        self.add(other.summation, other.count);
        Ok(())
    }

    fn calculate(&mut self) {
        self.value = if self.count == 0 {
            0
        } else {
            self.summation / self.count
        };
    }

    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError> {
        w.long(SUMMATION, self.summation)?;
        w.long(COUNT, self.count)?;
        w.long(VALUE, self.value)
    }

    fn read_columns(r: &ColumnReader<'_>) -> Result<Self, MetricsError> {
        Ok(Self {
            summation: r.long(SUMMATION)?,
            count: r.long(COUNT)?,
            value: r.long(VALUE)?,
        })
    }

    fn to_remote(&self, out: &mut RemoteMetrics) {
        out.longs = vec![self.summation, self.count];
    }

    fn from_remote(remote: &RemoteMetrics) -> Result<Self, MetricsError> {
        let [summation, count] = remote.longs::<2>("average")?;
        Ok(Self {
            summation,
            count,
            value: 0,
        })
    }
}
