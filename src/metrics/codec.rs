// Row and wire codecs for metrics.
// Rows go through the model's storage column names; the wire frame is
// [version: u8][wincode RemoteMetrics].

use wincode::{SchemaRead, SchemaWrite};

use super::MetricsError;
use super::dataset::DatasetEntry;
use crate::storage::model::Model;
use crate::storage::{ColumnValue, Row};
use crate::time_bucket::Granularity;

pub(crate) const REMOTE_VERSION: u8 = 1;

/// Flat transport form of one un-finalized entity.
///
/// `longs` and `dataset` carry the kind's raw running state, in the order the
/// kind writes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct RemoteMetrics {
    pub metric: String,
    pub granularity: Granularity,
    pub time_bucket: i64,
    pub entity_id: String,
    pub source_id: String,
    pub dest_id: String,
    pub component_id: i32,
    pub longs: Vec<i64>,
    pub dataset: Vec<DatasetEntry>,
}

impl RemoteMetrics {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, MetricsError> {
        let payload =
            wincode::serialize(self).map_err(|e| MetricsError::Remote(e.to_string()))?;
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(REMOTE_VERSION);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, MetricsError> {
        match bytes.split_first() {
            Some((&REMOTE_VERSION, payload)) => {
                wincode::deserialize(payload).map_err(|e| MetricsError::Remote(e.to_string()))
            }
            Some((version, _)) => Err(MetricsError::Remote(format!(
                "unsupported frame version {version}"
            ))),
            None => Err(MetricsError::Remote("empty frame".into())),
        }
    }

    /// The `n` raw longs a kind expects, or a decode error naming the kind.
    pub(crate) fn longs<const N: usize>(&self, kind: &'static str) -> Result<[i64; N], MetricsError> {
        <[i64; N]>::try_from(self.longs.as_slice()).map_err(|_| {
            MetricsError::Remote(format!(
                "{kind}: expected {N} values, got {}",
                self.longs.len()
            ))
        })
    }
}

/// Writes logical columns into a row keyed by storage names.
pub(crate) struct ColumnWriter<'a> {
    model: &'a Model,
    row: Row,
}

impl<'a> ColumnWriter<'a> {
    pub(crate) fn new(model: &'a Model) -> Self {
        Self {
            model,
            row: Row::new(),
        }
    }

    fn storage_name(&self, logical: &str) -> Result<&'a str, MetricsError> {
        self.model
            .storage_name(logical)
            .ok_or_else(|| MetricsError::MissingColumn {
                model: self.model.name.clone(),
                column: logical.to_string(),
            })
    }

    pub(crate) fn long(&mut self, logical: &str, value: i64) -> Result<(), MetricsError> {
        let name = self.storage_name(logical)?;
        self.row.insert(name, ColumnValue::Long(value));
        Ok(())
    }

    pub(crate) fn text(&mut self, logical: &str, value: String) -> Result<(), MetricsError> {
        let name = self.storage_name(logical)?;
        self.row.insert(name, ColumnValue::Text(value));
        Ok(())
    }

    pub(crate) fn finish(self) -> Row {
        self.row
    }
}

/// Reads logical columns back out of a stored row.
pub(crate) struct ColumnReader<'a> {
    model: &'a Model,
    row: &'a Row,
}

impl<'a> ColumnReader<'a> {
    pub(crate) fn new(model: &'a Model, row: &'a Row) -> Self {
        Self { model, row }
    }

    fn value(&self, logical: &str) -> Result<&'a ColumnValue, MetricsError> {
        let missing = || MetricsError::MissingColumn {
            model: self.model.name.clone(),
            column: logical.to_string(),
        };
        let name = self.model.storage_name(logical).ok_or_else(missing)?;
        self.row.get(name).ok_or_else(missing)
    }

    pub(crate) fn long(&self, logical: &str) -> Result<i64, MetricsError> {
        match self.value(logical)? {
            ColumnValue::Long(v) => Ok(*v),
            ColumnValue::Text(t) => t.parse().map_err(|_| MetricsError::ColumnType {
                column: logical.to_string(),
            }),
        }
    }

    pub(crate) fn text(&self, logical: &str) -> Result<&'a str, MetricsError> {
        match self.value(logical)? {
            ColumnValue::Text(t) => Ok(t),
            ColumnValue::Long(_) => Err(MetricsError::ColumnType {
                column: logical.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_version_prefix() {
        let remote = RemoteMetrics {
            metric: "service_cpm".into(),
            granularity: Granularity::Minute,
            time_bucket: 201903140926,
            entity_id: "order".into(),
            longs: vec![3],
            ..Default::default()
        };
        let bytes = remote.encode().unwrap();
        assert_eq!(bytes[0], REMOTE_VERSION);
        assert_eq!(RemoteMetrics::decode(&bytes).unwrap(), remote);
    }

    #[test]
    fn rejects_empty_and_unknown_frames() {
        assert!(RemoteMetrics::decode(&[]).is_err());
        assert!(RemoteMetrics::decode(&[9, 0, 0]).is_err());
    }

    #[test]
    fn longs_checks_arity() {
        let remote = RemoteMetrics {
            longs: vec![1, 2],
            ..Default::default()
        };
        assert_eq!(remote.longs::<2>("average").unwrap(), [1, 2]);
        assert!(remote.longs::<3>("apdex").is_err());
    }
}
