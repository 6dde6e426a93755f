// Sorted bucket -> count table shared by percentile and histogram metrics.
// Text form is `bucket,count|bucket,count`, ascending by bucket.

use wincode::{SchemaRead, SchemaWrite};

use super::MetricsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct DatasetEntry {
    pub bucket: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    entries: Vec<DatasetEntry>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dataset from unordered entries, summing duplicate buckets.
    pub fn from_entries(entries: impl IntoIterator<Item = DatasetEntry>) -> Self {
        let mut dataset = Self::new();
        for entry in entries {
            dataset.add(entry.bucket, entry.count);
        }
        dataset
    }

    pub fn add(&mut self, bucket: i64, count: i64) {
        match self.entries.binary_search_by_key(&bucket, |e| e.bucket) {
            Ok(idx) => {
                let slot = &mut self.entries[idx].count;
                *slot = slot.saturating_add(count);
            }
            Err(idx) => self.entries.insert(idx, DatasetEntry { bucket, count }),
        }
    }

    /// Element-wise sum with `other`.
    pub fn merge(&mut self, other: &Dataset) {
        for entry in &other.entries {
            self.add(entry.bucket, entry.count);
        }
    }

    pub fn total(&self) -> i64 {
        self.entries
            .iter()
            .fold(0i64, |acc, e| acc.saturating_add(e.count))
    }

    pub fn get(&self, bucket: i64) -> i64 {
        self.entries
            .binary_search_by_key(&bucket, |e| e.bucket)
            .map(|idx| self.entries[idx].count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    /// Smallest bucket whose cumulative count reaches `rank` percent of the total.
    pub fn rank_bucket(&self, rank: u32) -> Option<i64> {
        let total = self.total();
        if total <= 0 {
            return None;
        }
        // round(total * rank / 100), integer only
        let roof = (i128::from(total) * i128::from(rank) + 50) / 100;
        let mut cumulative: i128 = 0;
        for entry in &self.entries {
            cumulative += i128::from(entry.count);
            if cumulative >= roof {
                return Some(entry.bucket);
            }
        }
        self.entries.last().map(|e| e.bucket)
    }

    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{},{}", e.bucket, e.count))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn decode(text: &str) -> Result<Self, MetricsError> {
        let mut dataset = Self::new();
        for pair in text.split('|').filter(|p| !p.is_empty()) {
            let (bucket, count) = pair
                .split_once(',')
                .ok_or_else(|| MetricsError::InvalidDataset(pair.to_string()))?;
            let bucket = bucket
                .trim()
                .parse()
                .map_err(|_| MetricsError::InvalidDataset(pair.to_string()))?;
            let count = count
                .trim()
                .parse()
                .map_err(|_| MetricsError::InvalidDataset(pair.to_string()))?;
            dataset.add(bucket, count);
        }
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_buckets_sorted() {
        let mut d = Dataset::new();
        d.add(30, 1);
        d.add(10, 2);
        d.add(20, 1);
        d.add(10, 1);
        let buckets: Vec<i64> = d.entries().iter().map(|e| e.bucket).collect();
        assert_eq!(buckets, vec![10, 20, 30]);
        assert_eq!(d.get(10), 3);
        assert_eq!(d.total(), 5);
    }

    #[test]
    fn rank_bucket_scans_cumulative_counts() {
        let d = Dataset::from_entries([
            DatasetEntry { bucket: 0, count: 5 },
            DatasetEntry { bucket: 10, count: 3 },
            DatasetEntry { bucket: 20, count: 2 },
        ]);
        assert_eq!(d.rank_bucket(50), Some(0));
        assert_eq!(d.rank_bucket(75), Some(10));
        assert_eq!(d.rank_bucket(90), Some(20));
        assert_eq!(d.rank_bucket(99), Some(20));
        assert_eq!(Dataset::new().rank_bucket(50), None);
    }

    #[test]
    fn text_form_round_trips_and_rejects_garbage() {
        let d = Dataset::from_entries([
            DatasetEntry { bucket: 100, count: 4 },
            DatasetEntry { bucket: 0, count: 1 },
        ]);
        assert_eq!(d.encode(), "0,1|100,4");
        assert_eq!(Dataset::decode(&d.encode()).unwrap(), d);
        assert!(Dataset::decode("").unwrap().is_empty());
        assert!(Dataset::decode("1;2").is_err());
        assert!(Dataset::decode("a,2").is_err());
    }
}
