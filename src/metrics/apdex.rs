// Health index (apdex): satisfied / tolerating / frustrated counters.
// score = (satisfied + tolerating / 2) * 10000 / total, all integer.

use super::codec::{ColumnReader, ColumnWriter, RemoteMetrics};
use super::{MetricKind, MetricsError};
use crate::storage::model::{ColumnType, FieldDef, FieldTable, METRICS_BASE};

pub const SATISFIED: &str = "satisfied";
pub const TOLERATING: &str = "tolerating";
pub const FRUSTRATED: &str = "frustrated";
pub const VALUE: &str = "value";

/// Score of a window where every call was satisfied.
pub const MAX_SCORE: i64 = 10_000;
/// Tolerating upper bound as a multiple of the threshold.
const TOLERATING_FACTOR: i64 = 4;

pub static APDEX_FIELDS: FieldTable = FieldTable {
    name: "apdex",
    fields: &[
        FieldDef::new(SATISFIED, ColumnType::Long).storage_only(),
        FieldDef::new(TOLERATING, ColumnType::Long).storage_only(),
        FieldDef::new(FRUSTRATED, ColumnType::Long).storage_only(),
        FieldDef::new(VALUE, ColumnType::Int).value(),
    ],
    parent: Some(&METRICS_BASE),
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Apdex {
    satisfied: i64,
    tolerating: i64,
    frustrated: i64,
    score: i64,
}

impl Apdex {
    /// Classifies one call against `threshold` (ms).
    pub fn observe(&mut self, latency: i64, threshold: i64, success: bool) {
        if !success {
            self.frustrated += 1;
        } else if latency <= threshold {
            self.satisfied += 1;
        } else if latency <= threshold.saturating_mul(TOLERATING_FACTOR) {
            self.tolerating += 1;
        } else {
            self.frustrated += 1;
        }
    }

    pub fn counters(&self) -> (i64, i64, i64) {
        (self.satisfied, self.tolerating, self.frustrated)
    }

    /// Last calculated score in `0..=10000`.
    pub fn score(&self) -> i64 {
        self.score
    }
}

impl MetricKind for Apdex {
    fn fields() -> &'static FieldTable {
        &APDEX_FIELDS
    }

    fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        self.satisfied = self.satisfied.saturating_add(other.satisfied);
        self.tolerating = self.tolerating.saturating_add(other.tolerating);
        self.frustrated = self.frustrated.saturating_add(other.frustrated);
        Ok(())
    }

    fn calculate(&mut self) {
        let total =
            i128::from(self.satisfied) + i128::from(self.tolerating) + i128::from(self.frustrated);
        self.score = if total == 0 {
            0
        } else {
            let weighted = i128::from(self.satisfied) + i128::from(self.tolerating) / 2;
            // Bounded by MAX_SCORE, so the narrowing is lossless
            (weighted * i128::from(MAX_SCORE) / total) as i64
        };
    }

    fn write_columns(&self, w: &mut ColumnWriter<'_>) -> Result<(), MetricsError> {
        w.long(SATISFIED, self.satisfied)?;
        w.long(TOLERATING, self.tolerating)?;
        w.long(FRUSTRATED, self.frustrated)?;
        w.long(VALUE, self.score)
    }

    fn read_columns(r: &ColumnReader<'_>) -> Result<Self, MetricsError> {
        Ok(Self {
            satisfied: r.long(SATISFIED)?,
            tolerating: r.long(TOLERATING)?,
            frustrated: r.long(FRUSTRATED)?,
            score: r.long(VALUE)?,
        })
    }

    fn to_remote(&self, out: &mut RemoteMetrics) {
        out.longs = vec![self.satisfied, self.tolerating, self.frustrated];
    }

    fn from_remote(remote: &RemoteMetrics) -> Result<Self, MetricsError> {
        let [satisfied, tolerating, frustrated] = remote.longs::<3>("apdex")?;
        Ok(Self {
            satisfied,
            tolerating,
            frustrated,
            score: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_against_threshold() {
        let mut apdex = Apdex::default();
        apdex.observe(500, 500, true);
        apdex.observe(2000, 500, true);
        apdex.observe(2001, 500, true);
        apdex.observe(10, 500, false);
        assert_eq!(apdex.counters(), (1, 1, 2));
    }

    #[test]
    fn tolerating_counts_half_after_integer_division() {
        let mut apdex = Apdex::default();
        apdex.observe(100, 500, true);
        apdex.observe(1000, 500, true);
        apdex.calculate();
        assert_eq!(apdex.score(), 5000);
    }

    fn threshold(name: &str) -> i64 {
        if name == "foo" { 500 } else { 1000 }
    }

    fn feed(apdex: &mut Apdex, calls: &[(i64, &str, u16)]) {
        for &(latency, name, status) in calls {
            apdex.observe(latency, threshold(name), status < 400);
        }
    }

    fn score_of(calls: &[(i64, &str, u16)]) -> i64 {
        let mut apdex = Apdex::default();
        feed(&mut apdex, calls);
        apdex.calculate();
        apdex.score()
    }

    #[test]
    fn reference_scores() {
        assert_eq!(score_of(&[(200, "foo", 200), (300, "bar", 200)]), 10_000);
        assert_eq!(score_of(&[(200, "foo", 200), (1500, "bar", 200)]), 5000);
        assert_eq!(score_of(&[(200, "foo", 200), (300, "bar", 404)]), 5000);
        assert_eq!(score_of(&[(200, "foo", 200), (1500, "bar", 404)]), 5000);
        assert_eq!(score_of(&[(200, "foo", 200), (5000, "bar", 200)]), 5000);
    }

    #[test]
    fn merged_score_matches_direct_feed() {
        let first = [
            (200, "foo", 200),
            (300, "bar", 200),
            (200, "foo", 200),
            (1500, "bar", 200),
        ];
        let second = [
            (200, "foo", 200),
            (300, "bar", 404),
            (200, "foo", 200),
            (1500, "bar", 404),
            (200, "foo", 200),
            (5000, "bar", 200),
        ];
        let mut a = Apdex::default();
        feed(&mut a, &first);
        let mut b = Apdex::default();
        feed(&mut b, &second);
        a.merge(&b).unwrap();
        a.calculate();
        assert_eq!(a.score(), 6000);

        let all: Vec<_> = first.iter().chain(second.iter()).copied().collect();
        assert_eq!(score_of(&all), 6000);
    }

    #[test]
    fn huge_counters_score_without_overflow() {
        let mut a = Apdex {
            satisfied: i64::MAX / 2,
            tolerating: 0,
            frustrated: i64::MAX / 2,
            score: 0,
        };
        a.merge(&a.clone()).unwrap();
        a.calculate();
        assert_eq!(a.score(), 5000);
    }
}
