use airq_ingest::cli::Args;
use airq_ingest::config::Config;
use airq_ingest::consumers::{AggregateSummary, Consumer, RollingAggregate, StatusLog};
use airq_ingest::control::IngestController;
use airq_ingest::ingest::Pipeline;
use airq_ingest::pipeline::{spawn_pipeline, IngestStats, PipelineHandle};
use airq_ingest::store::{ReadingStore, SqliteStore};
use airq_ingest::transport::SerialOpener;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,airq_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "airq-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn run_query(args: &Args, store: &SqliteStore) -> Result<()> {
    if args.print_stats {
        println!("{}", serde_json::to_string_pretty(&store.statistics()?)?);
    }
    if let Some(limit) = args.recent_limit() {
        println!("{}", serde_json::to_string_pretty(&store.recent_readings(limit)?)?);
    }
    if let Some(limit) = args.export_limit() {
        println!("{}", serde_json::to_string(&store.export_rows(limit)?)?);
    }
    Ok(())
}

async fn log_stats(
    handle: PipelineHandle,
    aggregate: watch::Receiver<AggregateSummary>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let ingest = handle.stats().snapshot();
        let online = aggregate.borrow().online_count();
        match handle.statistics().await {
            Ok(store) => tracing::info!(
                bytes_read = ingest.bytes_read,
                frames = ingest.frames_extracted,
                discarded = ingest.frames_discarded,
                accepted = ingest.readings_accepted,
                rejected = ingest.readings_rejected,
                persisted = ingest.rows_persisted,
                persist_failures = ingest.persist_failures,
                consumer_failures = ingest.consumer_failures,
                connected = ingest.transport_connected,
                online,
                total_records = store.total_records,
                size_on_disk = store.size_on_disk_bytes,
                "ingest stats"
            ),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read store statistics");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    init_tracing(&config)?;

    let store = SqliteStore::open(&config.database_path).with_context(|| {
        format!("failed to open database {}", config.database_path.display())
    })?;
    if args.is_query() {
        return run_query(&args, &store);
    }
    let transport = config.transport_config()?;

    let stats = Arc::new(IngestStats::new());
    let aggregate_window = i64::try_from(config.aggregate_window_secs).unwrap_or(i64::MAX);
    let (aggregate, aggregate_rx) = RollingAggregate::new(aggregate_window);
    let consumers: Vec<Box<dyn Consumer>> = vec![Box::new(StatusLog::new()), Box::new(aggregate)];
    let pipeline = Pipeline::new(
        config.pipeline_settings(),
        Box::new(store),
        consumers,
        stats.clone(),
    );

    let cancel = CancellationToken::new();
    let (handle, events_tx, pipeline_task) =
        spawn_pipeline(pipeline, config.tick_interval(), cancel.clone());
    let controller = IngestController::new(
        Arc::new(SerialOpener),
        config.reader_settings(),
        events_tx,
        stats.clone(),
    );

    let stats_handle = config
        .stats_log_interval()
        .map(|interval| tokio::spawn(log_stats(handle.clone(), aggregate_rx.clone(), interval)));

    let started = controller.start(transport).await;
    if let Err(err) = &started {
        tracing::error!(error = %err, "failed to start ingest");
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received");
    }

    controller.stop().await?;
    cancel.cancel();
    if let Err(err) = pipeline_task.await {
        tracing::error!(error = %err, "ingest pipeline task failed");
    }
    if let Some(stats_handle) = stats_handle {
        stats_handle.abort();
    }

    started
}
