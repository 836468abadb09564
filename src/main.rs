use anyhow::{Context, Result};
use clap::Parser;
use log_collector::config::{Config, LEAK_THRESHOLDS_SECS};
use log_collector::metrics::{Metrics, ThresholdLabels};
use log_collector::queue::QueueHandle;
use log_collector::store::pool::{PgConnector, Pool};
use log_collector::store::{LogStore, RecordStore};
use log_collector::worker::{spawn_worker, WorkerStats};
use log_collector::{cli, openapi, queue, routes, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind listener on {addr}: port already in use. Stop the other service or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind listener on {addr}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!("{}", serde_json::to_string_pretty(&openapi::openapi_json())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_env()?;
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }

    let metrics = Arc::new(Metrics::new());
    let queue = queue::start(config.queue_config()).context("failed to start the durable queue")?;
    let store = Arc::new(LogStore::new(
        &config.database_url,
        config.pool_config(),
        metrics.clone(),
    ));
    metrics.pg_pool_size.set(config.db_pool_size as i64);

    // Ingest must come up even when the database is down; the schema task
    // keeps retrying until the store is reachable.
    tokio::spawn(ensure_schema_with_retry(store.clone()));

    let worker_stats = Arc::new(WorkerStats::new());
    let cancel = CancellationToken::new();
    let mut worker_handles = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        worker_handles.push(spawn_worker(
            queue.clone(),
            store.clone() as Arc<dyn RecordStore>,
            config.worker_config(index),
            worker_stats.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
    }

    let poller = tokio::spawn(gauge_poller(
        queue.clone(),
        store.pool().clone(),
        metrics.clone(),
    ));
    let trimmer = tokio::spawn(trim_sweep(
        queue.clone(),
        config.retain_acked,
        config.trim_sweep_interval(),
    ));

    let app_state = state::AppState {
        config: config.clone(),
        queue: queue.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
        worker_stats: worker_stats.clone(),
    };
    let app = routes::router(app_state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, workers = config.workers, "log-collector listening");

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result.context("http server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Cooperative shutdown: workers finish and ack their current batch.
    cancel.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    poller.abort();
    trimmer.abort();
    drop(queue);

    Ok(())
}

async fn ensure_schema_with_retry(store: Arc<LogStore>) {
    let mut delay = Duration::from_secs(1);
    loop {
        match store.ensure_schema().await {
            Ok(()) => {
                tracing::info!("database schema ready");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, retry_in_secs = delay.as_secs(), "schema setup failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
        }
    }
}

/// Mirror queue and pool state into gauges on a fixed cadence.
async fn gauge_poller(queue: QueueHandle, pool: Pool<PgConnector>, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;

        match queue.status().await {
            Ok(status) => {
                metrics.queue_stream_length.set(status.length as i64);
                metrics
                    .queue_pending_entries
                    .set(status.pending_entries as i64);
            }
            Err(_) => return,
        }

        let stats = pool.stats();
        metrics.pg_pool_in_use_connections.set(stats.in_use as i64);
        metrics.pg_pool_available_connections.set(stats.idle as i64);

        let ages = pool.lease_ages();
        for threshold in LEAK_THRESHOLDS_SECS {
            let held = ages
                .iter()
                .filter(|age| age.as_secs() >= threshold)
                .count();
            metrics
                .pg_connection_long_held
                .get_or_create(&ThresholdLabels {
                    threshold_seconds: threshold,
                })
                .set(held as i64);
        }
        let newly_leaked = pool.mark_leaks(Duration::from_secs(LEAK_THRESHOLDS_SECS[2]));
        if newly_leaked > 0 {
            metrics.pg_connection_leaked_total.inc_by(newly_leaked);
            tracing::warn!(count = newly_leaked, "database sessions held past the leak threshold");
        }
    }
}

/// Periodically drop the acked prefix of the stream, keeping a bounded tail
/// for inspection. The queue clamps the cut so pending entries survive.
async fn trim_sweep(queue: QueueHandle, retain_acked: u64, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let status = match queue.status().await {
            Ok(status) => status,
            Err(_) => return,
        };
        let target = status.next_id.saturating_sub(retain_acked);
        if target <= status.first_id {
            continue;
        }
        match queue.trim(target).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "trimmed acked queue entries"),
            Err(err) => {
                tracing::warn!(error = %err, "queue trim failed");
            }
        }
    }
}
