// Sum: running total (call counts, error counts).

use super::codec::{ColumnReader, ColumnWriter, RemoteMetrics};
use super::{MetricKind, MetricsError};
use crate::storage::model::{ColumnType, FieldDef, FieldTable, METRICS_BASE};

pub const VALUE: &str = "value";

pub static SUM_FIELDS: FieldTable = FieldTable {
    name: "sum",
    fields: &[FieldDef::new(VALUE, ColumnType::Long).value()],
    parent: Some(&METRICS_BASE),
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sum {
    value: i64,
}

impl Sum {
    pub fn new(value: i64) -> Self {
        Self { value }
    }

    pub fn add(&mut self, amount: i64) {
        self.value = self.value.saturating_add(amount);
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

impl MetricKind for Sum {
    fn fields() -> &'static FieldTable {
        &SUM_FIELDS
    }

    fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        self.add(other.value);
        Ok(())
    }

    fn calculate(&mut self) {}

    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError> {
        w.long(VALUE, self.value)
    }

    fn read_columns(r: &ColumnReader<'_>) -> Result<Self, MetricsError> {
        Ok(Self::new(r.long(VALUE)?))
    }

    fn to_remote(&self, out: &mut RemoteMetrics) {
        out.longs = vec![self.value];
    }

    fn from_remote(remote: &RemoteMetrics) -> Result<Self, MetricsError> {
        let [value] = remote.longs::<1>("sum")?;
        Ok(Self::new(value))
    }
}
