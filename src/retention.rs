// Background retention: deletes buckets older than each granularity's TTL from
// models flagged delete_history, and compacts the store on a cron schedule or
// fixed interval.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::storage::{StorageDriver, StorageError, StorageModels};
use crate::time_bucket::{Granularity, TimeBucketAllocator};

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub interval_secs: u64,
    pub minute_ttl_days: u32,
    pub hour_ttl_days: u32,
    pub day_ttl_days: u32,
    pub month_ttl_days: u32,
    /// Optional cron expression for compaction (e.g. "0 0 3 * * *"). Uses local time.
    pub compact_schedule: Option<String>,
    /// Compact every N seconds when compact_schedule is not set.
    pub compact_interval_secs: u64,
}

impl RetentionConfig {
    pub fn ttl_days(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Minute => self.minute_ttl_days,
            Granularity::Hour => self.hour_ttl_days,
            Granularity::Day => self.day_ttl_days,
            Granularity::Month => self.month_ttl_days,
        }
    }
}

pub fn spawn(
    storage: Arc<dyn StorageDriver>,
    models: Arc<StorageModels>,
    allocator: TimeBucketAllocator,
    config: RetentionConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(storage, models, allocator, config).await;
    })
}

/// When the store gets compacted.
#[derive(Debug, Clone)]
pub enum CompactSchedule {
    /// Cron expression evaluated in local time.
    Cron(cron::Schedule),
    Every(Duration),
}

impl CompactSchedule {
    pub fn from_config(config: &RetentionConfig) -> Result<Self, cron::error::Error> {
        match &config.compact_schedule {
            Some(expr) => Ok(Self::Cron(cron::Schedule::from_str(expr)?)),
            None => Ok(Self::Every(Duration::from_secs(config.compact_interval_secs))),
        }
    }

    /// Wait from `now` until the next compaction. An exhausted cron schedule
    /// re-checks hourly.
    pub fn delay_from<Tz: chrono::TimeZone>(&self, now: &chrono::DateTime<Tz>) -> Duration {
        match self {
            Self::Every(interval) => *interval,
            Self::Cron(schedule) => match schedule.after(now).next() {
                Some(next) => (next - now.clone())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1)),
                None => Duration::from_secs(3600),
            },
        }
    }

    fn next_deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.delay_from(&chrono::Local::now())
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[instrument(skip(storage, models, allocator), fields(interval_secs = config.interval_secs))]
async fn run(
    storage: Arc<dyn StorageDriver>,
    models: Arc<StorageModels>,
    allocator: TimeBucketAllocator,
    config: RetentionConfig,
) {
    let mut ttl_interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    ttl_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let compaction = if storage.supports_compaction() {
        match CompactSchedule::from_config(&config) {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                warn!(error = %e, operation = "compact", "invalid compact_schedule; compaction will not run");
                None
            }
        }
    } else {
        debug!("storage driver has nothing to compact");
        None
    };
    let mut next_compaction = compaction.as_ref().map(CompactSchedule::next_deadline);

    loop {
        tokio::select! {
            _ = ttl_interval.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                match run_one_pass(storage.as_ref(), &models, &allocator, &config, now_ms).await {
                    Ok(0) => debug!("retention pass: nothing expired"),
                    Ok(deleted) => info!(deleted, "retention pass"),
                    Err(e) => warn!(error = %e, operation = "retention", "retention pass failed"),
                }
            }
            _ = wait_until(next_compaction) => {
                if let Err(e) = storage.compact().await {
                    warn!(error = %e, operation = "compact", "compaction failed");
                } else {
                    info!("compaction complete");
                }
                next_compaction = compaction.as_ref().map(CompactSchedule::next_deadline);
            }
        }
    }
}

/// Deletes expired buckets of every model that allows it. Returns rows deleted.
pub async fn run_one_pass(
    storage: &dyn StorageDriver,
    models: &StorageModels,
    allocator: &TimeBucketAllocator,
    config: &RetentionConfig,
    now_ms: i64,
) -> Result<u64, StorageError> {
    let mut deleted = 0;
    for model in models.all().iter().filter(|m| m.delete_history) {
        let ttl_ms = i64::from(config.ttl_days(model.granularity)) * MS_PER_DAY;
        let cutoff = allocator.bucket(now_ms.saturating_sub(ttl_ms), model.granularity);
        let n = storage.delete_before(model, cutoff).await?;
        if n > 0 {
            debug!(model = %model.name, cutoff, deleted = n, "expired buckets deleted");
        }
        deleted += n;
    }
    Ok(deleted)
}
