use crate::config::Config;
use crate::metrics::Metrics;
use crate::queue;
use crate::state::AppState;
use crate::store::pool::PoolConfig;
use crate::store::LogStore;
use crate::worker::WorkerStats;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A database endpoint nothing listens on: connects fail fast with a refusal
/// instead of hanging, which is what the degraded-path tests want.
const UNREACHABLE_DATABASE_URL: &str = "postgresql://postgres@127.0.0.1:1/postgres";

pub fn test_config() -> Config {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let queue_dir: PathBuf = tempdir.keep();

    Config {
        database_url: UNREACHABLE_DATABASE_URL.to_string(),
        queue_dir,
        stream_name: "logs:stream".to_string(),
        group_name: "log_workers".to_string(),
        queue_max_len: None,
        segment_roll_bytes: 64 * 1024,
        state_sync_interval_ms: 0,
        workers: 1,
        consumer_prefix: "worker".to_string(),
        batch_size: 100,
        read_block_ms: 50,
        claim_idle_ms: 200,
        claim_sweep_ms: 100,
        retry_budget: 0,
        retry_base_backoff_ms: 5,
        cache_ttl_query_secs: 300,
        cache_ttl_stats_secs: 60,
        retain_acked: 100,
        trim_sweep_ms: 60_000,
        db_pool_size: 2,
        db_pool_overflow: 1,
        db_acquire_timeout_secs: 2,
        db_recycle_secs: 3600,
        db_health_check: true,
    }
}

pub fn test_state() -> AppState {
    let config = test_config();
    let metrics = Arc::new(Metrics::new());
    let queue = queue::start(config.queue_config()).expect("start queue");
    let pool_config = PoolConfig {
        size: config.db_pool_size,
        overflow: config.db_pool_overflow,
        acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
        recycle_after: Duration::from_secs(config.db_recycle_secs),
        health_check_on_acquire: config.db_health_check,
        ..PoolConfig::default()
    };
    let store = Arc::new(LogStore::new(
        &config.database_url,
        pool_config,
        metrics.clone(),
    ));

    AppState {
        config,
        queue,
        store,
        metrics,
        worker_stats: Arc::new(WorkerStats::new()),
    }
}
