use anyhow::Result;
use metricflow::collaborators::{LogReporter, MemoryInventory, StaticThresholds};
use metricflow::config::StorageDriverKind;
use metricflow::metrics::{MetricContext, MetricRegistry};
use metricflow::pipeline::{Pipeline, PipelineDeps, PipelineHandle};
use metricflow::source::DecodedRecord;
use metricflow::storage::{MemoryStorage, SqliteStorage, StorageDriver, StorageModels};
use metricflow::time_bucket::{Granularity, TimeBucketAllocator};
use metricflow::topology::{ComponentLibrary, TopologyQueryService, TopologyScope};
use metricflow::{config, retention};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "{} starting",
        env!("CARGO_PKG_NAME")
    );

    let allocator = TimeBucketAllocator::new(app_config.time.utc_offset_minutes);
    let dictionary = Arc::new(StaticThresholds::new(
        app_config.metrics.default_apdex_threshold,
        app_config.metrics.apdex_thresholds.clone(),
    ));
    let mut context = MetricContext::new(dictionary, allocator);
    context.percentile_precision = app_config.metrics.percentile_precision;
    context.histogram_step = app_config.metrics.histogram_step;
    context.histogram_buckets = app_config.metrics.histogram_buckets;
    let registry = Arc::new(MetricRegistry::with_defaults(context)?);

    let models = Arc::new(StorageModels::new());
    registry.register_models(&models)?;

    let storage: Arc<dyn StorageDriver> = match app_config.storage.driver {
        StorageDriverKind::Sqlite => Arc::new(
            SqliteStorage::connect(&app_config.storage.path, app_config.storage.max_pool_size)
                .await?,
        ),
        StorageDriverKind::Memory => Arc::new(MemoryStorage::new()),
    };
    for model in models.all() {
        storage.ensure_schema(&model).await?;
    }

    let inventory = Arc::new(MemoryInventory::new());
    let reporter = Arc::new(LogReporter::default());
    let handle = Pipeline::start(
        PipelineDeps {
            registry: registry.clone(),
            models: models.clone(),
            storage: storage.clone(),
            reporter: reporter.clone(),
            inventory: inventory.clone(),
        },
        app_config.pipeline_config(),
    );

    let retention_handle = retention::spawn(
        storage.clone(),
        models.clone(),
        allocator,
        app_config.retention_config(),
    );

    let stats = handle.stats();
    let stats_log_interval =
        std::time::Duration::from_secs(app_config.ingest.stats_log_interval_secs);
    let stats_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(stats_log_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            let s = stats.snapshot();
            tracing::info!(
                records = s.records,
                events = s.events,
                entities = s.entities,
                routed = s.routed,
                persisted = s.persisted,
                dropped = s.dropped,
                "pipeline stats"
            );
        }
    });

    tokio::select! {
        result = ingest_records(&handle, &app_config.ingest.path) => {
            let records = result?;
            tracing::info!(records, "ingest finished");
        }
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
        }
    }

    handle.shutdown().await;
    stats_handle.abort();
    retention_handle.abort();
    tracing::info!(failures = reporter.failures(), "shutdown complete");

    if app_config.topology.print_on_exit {
        let topology = TopologyQueryService::new(
            storage,
            models,
            registry,
            inventory,
            ComponentLibrary::new(app_config.components()?),
        );
        let today = allocator.now(Granularity::Day);
        let global = topology
            .assemble_topology(Granularity::Day, today, today, TopologyScope::Global)
            .await?;
        println!("{}", serde_json::to_string_pretty(&global)?);
    }

    Ok(())
}

/// Feeds newline-delimited JSON records from `path` (stdin when empty or "-").
/// Malformed lines are logged and skipped.
async fn ingest_records(handle: &PipelineHandle, path: &str) -> Result<u64> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = if path.is_empty() || path == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(tokio::fs::File::open(path).await?)
    };
    let mut lines = BufReader::new(reader).lines();
    let mut records = 0;
    let mut line_no = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DecodedRecord>(&line) {
            Ok(record) => {
                handle.ingest(&record).await?;
                records += 1;
            }
            Err(e) => tracing::warn!(
                error = %e,
                line = line_no,
                operation = "parse_record",
                "skipping malformed record"
            ),
        }
    }
    Ok(records)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
