use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::{PipelineConfig, RetryPolicy};
use crate::retention::RetentionConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub pipeline: PipelineSection,
    pub cluster: ClusterConfig,
    pub retry: RetryConfig,
    #[serde(default)]
    pub time: TimeConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriverKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub driver: StorageDriverKind,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
}

fn default_max_pool_size() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    pub local_workers: usize,
    pub flush_interval_ms: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Number of owner nodes (persistence workers) identities are routed to.
    pub nodes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeConfig {
    /// Offset of the bucket time zone from UTC, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub percentile_precision: i64,
    pub histogram_step: i64,
    pub histogram_buckets: u32,
    pub default_apdex_threshold: i64,
    /// Per-service apdex thresholds in ms.
    #[serde(default)]
    pub apdex_thresholds: HashMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSection {
    pub interval_secs: u64,
    pub minute_ttl_days: u32,
    pub hour_ttl_days: u32,
    pub day_ttl_days: u32,
    pub month_ttl_days: u32,
    /// Cron expression for compaction (sec min hour dom month dow), local time.
    #[serde(default)]
    pub compact_schedule: Option<String>,
    #[serde(default = "default_compact_interval_secs")]
    pub compact_interval_secs: u64,
}

fn default_compact_interval_secs() -> u64 {
    86_400
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            minute_ttl_days: 1,
            hour_ttl_days: 7,
            day_ttl_days: 90,
            month_ttl_days: 730,
            compact_schedule: None,
            compact_interval_secs: default_compact_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Newline-delimited JSON records; empty or "-" reads stdin.
    #[serde(default)]
    pub path: String,
    /// How often to log pipeline stats at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

fn default_stats_log_interval_secs() -> u64 {
    60
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyConfig {
    /// Print the global topology of the current day as JSON after ingest.
    #[serde(default)]
    pub print_on_exit: bool,
    /// Component id -> display name.
    #[serde(default)]
    pub components: HashMap<String, String>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            local_workers: self.pipeline.local_workers,
            flush_interval: Duration::from_millis(self.pipeline.flush_interval_ms),
            channel_capacity: self.pipeline.channel_capacity,
            nodes: self.cluster.nodes,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                backoff: Duration::from_millis(self.retry.backoff_ms),
            },
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            interval_secs: self.retention.interval_secs,
            minute_ttl_days: self.retention.minute_ttl_days,
            hour_ttl_days: self.retention.hour_ttl_days,
            day_ttl_days: self.retention.day_ttl_days,
            month_ttl_days: self.retention.month_ttl_days,
            compact_schedule: self.retention.compact_schedule.clone(),
            compact_interval_secs: self.retention.compact_interval_secs,
        }
    }

    /// Component names keyed by numeric id.
    pub fn components(&self) -> anyhow::Result<HashMap<i32, String>> {
        self.topology
            .components
            .iter()
            .map(|(id, name)| {
                let id: i32 = id.parse().map_err(|_| {
                    anyhow::anyhow!("topology.components key '{}' is not an integer", id)
                })?;
                Ok((id, name.clone()))
            })
            .collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.storage.driver != StorageDriverKind::Sqlite || !self.storage.path.is_empty(),
            "storage.path must be non-empty for the sqlite driver"
        );
        anyhow::ensure!(
            self.storage.max_pool_size > 0,
            "storage.max_pool_size must be > 0, got {}",
            self.storage.max_pool_size
        );
        anyhow::ensure!(
            self.pipeline.local_workers > 0,
            "pipeline.local_workers must be > 0, got {}",
            self.pipeline.local_workers
        );
        anyhow::ensure!(
            self.pipeline.flush_interval_ms > 0,
            "pipeline.flush_interval_ms must be > 0, got {}",
            self.pipeline.flush_interval_ms
        );
        anyhow::ensure!(
            self.pipeline.channel_capacity > 0,
            "pipeline.channel_capacity must be > 0, got {}",
            self.pipeline.channel_capacity
        );
        anyhow::ensure!(
            self.cluster.nodes > 0,
            "cluster.nodes must be > 0, got {}",
            self.cluster.nodes
        );
        anyhow::ensure!(
            self.retry.max_attempts > 0,
            "retry.max_attempts must be > 0, got {}",
            self.retry.max_attempts
        );
        anyhow::ensure!(
            (-1439..=1439).contains(&self.time.utc_offset_minutes),
            "time.utc_offset_minutes must be within +-1439, got {}",
            self.time.utc_offset_minutes
        );
        anyhow::ensure!(
            self.metrics.percentile_precision > 0,
            "metrics.percentile_precision must be > 0, got {}",
            self.metrics.percentile_precision
        );
        anyhow::ensure!(
            self.metrics.histogram_step > 0,
            "metrics.histogram_step must be > 0, got {}",
            self.metrics.histogram_step
        );
        anyhow::ensure!(
            self.metrics.histogram_buckets > 0,
            "metrics.histogram_buckets must be > 0, got {}",
            self.metrics.histogram_buckets
        );
        anyhow::ensure!(
            self.metrics.default_apdex_threshold > 0,
            "metrics.default_apdex_threshold must be > 0, got {}",
            self.metrics.default_apdex_threshold
        );
        for (name, threshold) in &self.metrics.apdex_thresholds {
            anyhow::ensure!(
                *threshold > 0,
                "metrics.apdex_thresholds.{} must be > 0, got {}",
                name,
                threshold
            );
        }
        anyhow::ensure!(
            self.retention.interval_secs > 0,
            "retention.interval_secs must be > 0, got {}",
            self.retention.interval_secs
        );
        for (key, days) in [
            ("minute_ttl_days", self.retention.minute_ttl_days),
            ("hour_ttl_days", self.retention.hour_ttl_days),
            ("day_ttl_days", self.retention.day_ttl_days),
            ("month_ttl_days", self.retention.month_ttl_days),
        ] {
            anyhow::ensure!(days > 0, "retention.{} must be > 0, got {}", key, days);
        }
        anyhow::ensure!(
            self.retention.compact_interval_secs > 0,
            "retention.compact_interval_secs must be > 0, got {}",
            self.retention.compact_interval_secs
        );
        if let Some(schedule) = &self.retention.compact_schedule {
            cron::Schedule::from_str(schedule).map_err(|e| {
                anyhow::anyhow!("retention.compact_schedule '{}' is invalid: {}", schedule, e)
            })?;
        }
        anyhow::ensure!(
            self.ingest.stats_log_interval_secs > 0,
            "ingest.stats_log_interval_secs must be > 0, got {}",
            self.ingest.stats_log_interval_secs
        );
        self.components()?;
        Ok(())
    }
}
