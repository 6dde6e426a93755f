// Time bucket allocation: timestamp (ms) + granularity -> sortable integer bucket.
// Buckets are calendar boundaries in a fixed UTC offset, e.g. minute = YYYYMMDDHHmm.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// Bucket width. Also the down-sampling level of a stored model.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    SchemaRead, SchemaWrite,
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Minute,
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Month,
    ];

    /// Model name suffix for this granularity (`service_cpm_hour`).
    pub fn suffix(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
        }
    }

    /// Number of trailing decimal digits this granularity keeps beyond `YYYY`.
    fn digits(self) -> u32 {
        match self {
            Granularity::Month => 2,
            Granularity::Day => 4,
            Granularity::Hour => 6,
            Granularity::Minute => 8,
        }
    }

    /// Converts a bucket of granularity `self` into the coarser `to` bucket.
    ///
    /// Returns `None` when `to` is finer than `self`.
    pub fn downsample(self, bucket: i64, to: Granularity) -> Option<i64> {
        if to > self {
            let drop = self.digits() - to.digits();
            Some(bucket / 10_i64.pow(drop))
        } else if to == self {
            Some(bucket)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Maps timestamps to buckets in a configured time zone.
#[derive(Debug, Clone, Copy)]
pub struct TimeBucketAllocator {
    offset: FixedOffset,
}

impl TimeBucketAllocator {
    /// `utc_offset_minutes` outside +-23:59 falls back to UTC.
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(0)
    }

    /// Bucket for `timestamp_millis`. Never fails: timestamps outside year
    /// 0000..=9999 are clamped so the encoding keeps its fixed width.
    pub fn bucket(&self, timestamp_millis: i64, granularity: Granularity) -> i64 {
        let ts = timestamp_millis.clamp(min_millis(), max_millis());
        let utc = DateTime::<Utc>::from_timestamp_millis(ts).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let local = utc.with_timezone(&self.offset);
        // Clamping is done in UTC; the offset may push a year past the range.
        let year = i64::from(local.year().clamp(0, 9999));
        let month = i64::from(local.month());
        let day = i64::from(local.day());
        let hour = i64::from(local.hour());
        let minute = i64::from(local.minute());

        match granularity {
            Granularity::Month => year * 100 + month,
            Granularity::Day => (year * 100 + month) * 100 + day,
            Granularity::Hour => ((year * 100 + month) * 100 + day) * 100 + hour,
            Granularity::Minute => {
                (((year * 100 + month) * 100 + day) * 100 + hour) * 100 + minute
            }
        }
    }

    /// Bucket of the current wall clock.
    pub fn now(&self, granularity: Granularity) -> i64 {
        self.bucket(Utc::now().timestamp_millis(), granularity)
    }
}

impl Default for TimeBucketAllocator {
    fn default() -> Self {
        Self::utc()
    }
}

fn min_millis() -> i64 {
    NaiveDate::from_ymd_opt(0, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(i64::MIN)
}

fn max_millis() -> i64 {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(i64::MAX)
}
