use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Leak reporting thresholds for held database sessions, in seconds.
pub const LEAK_THRESHOLDS_SECS: [u64; 3] = [60, 300, 900];

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub queue_dir: PathBuf,
    pub stream_name: String,
    pub group_name: String,
    pub queue_max_len: Option<u64>,
    pub segment_roll_bytes: u64,
    pub state_sync_interval_ms: u64,

    pub workers: usize,
    pub consumer_prefix: String,
    pub batch_size: usize,
    pub read_block_ms: u64,
    pub claim_idle_ms: u64,
    pub claim_sweep_ms: u64,
    pub retry_budget: u32,
    pub retry_base_backoff_ms: u64,

    pub cache_ttl_query_secs: u64,
    pub cache_ttl_stats_secs: u64,
    pub retain_acked: u64,
    pub trim_sweep_ms: u64,

    pub db_pool_size: usize,
    pub db_pool_overflow: usize,
    pub db_acquire_timeout_secs: u64,
    pub db_recycle_secs: u64,
    pub db_health_check: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("DATABASE_URL is required")?;

        let queue_dir = env::var("LOG_QUEUE_DIR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/queue"));

        let stream_name =
            env::var("COLLECTOR_STREAM_NAME").unwrap_or_else(|_| "logs:stream".to_string());
        let group_name =
            env::var("COLLECTOR_GROUP_NAME").unwrap_or_else(|_| "log_workers".to_string());
        let queue_max_len = env::var("COLLECTOR_QUEUE_MAX_LEN")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v != 0);

        let batch_size = env_parse("COLLECTOR_BATCH_SIZE", 100usize).max(1);
        let workers = env_parse("COLLECTOR_WORKERS", 4usize).max(1);
        let consumer_prefix =
            env::var("COLLECTOR_CONSUMER_PREFIX").unwrap_or_else(|_| "worker".to_string());

        Ok(Self {
            database_url,
            queue_dir,
            stream_name,
            group_name,
            queue_max_len,
            segment_roll_bytes: env_parse("COLLECTOR_SEGMENT_ROLL_BYTES", 8 * 1024 * 1024u64),
            state_sync_interval_ms: env_parse("COLLECTOR_SYNC_INTERVAL_MS", 200u64),
            workers,
            consumer_prefix,
            batch_size,
            read_block_ms: env_parse("COLLECTOR_READ_BLOCK_MS", 2000u64),
            claim_idle_ms: env_parse("COLLECTOR_CLAIM_IDLE_MS", 60_000u64),
            claim_sweep_ms: env_parse("COLLECTOR_CLAIM_SWEEP_MS", 30_000u64),
            retry_budget: env_parse("COLLECTOR_RETRY_BUDGET", 3u32),
            retry_base_backoff_ms: env_parse("COLLECTOR_RETRY_BASE_BACKOFF_MS", 100u64),
            cache_ttl_query_secs: env_parse("COLLECTOR_CACHE_TTL_QUERY_SECS", 300u64),
            cache_ttl_stats_secs: env_parse("COLLECTOR_CACHE_TTL_STATS_SECS", 60u64),
            retain_acked: env_parse("COLLECTOR_RETAIN_ACKED", 10_000u64),
            trim_sweep_ms: env_parse("COLLECTOR_TRIM_SWEEP_MS", 60_000u64),
            db_pool_size: env_parse("COLLECTOR_DB_POOL_SIZE", 10usize).max(1),
            db_pool_overflow: env_parse("COLLECTOR_DB_POOL_OVERFLOW", 5usize),
            db_acquire_timeout_secs: env_parse("COLLECTOR_DB_ACQUIRE_TIMEOUT_SECS", 30u64),
            db_recycle_secs: env_parse("COLLECTOR_DB_RECYCLE_SECS", 3600u64),
            db_health_check: env::var("COLLECTOR_DB_HEALTH_CHECK")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn claim_idle_threshold(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn claim_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.claim_sweep_ms)
    }

    pub fn retry_base_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_base_backoff_ms)
    }

    pub fn cache_ttl_query(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_query_secs)
    }

    pub fn cache_ttl_stats(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_stats_secs)
    }

    pub fn trim_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.trim_sweep_ms)
    }

    pub fn state_sync_interval(&self) -> Duration {
        Duration::from_millis(self.state_sync_interval_ms)
    }

    pub fn queue_config(&self) -> crate::queue::QueueConfig {
        crate::queue::QueueConfig {
            dir: self.queue_dir.clone(),
            stream_name: self.stream_name.clone(),
            max_len: self.queue_max_len,
            segment_roll_bytes: self.segment_roll_bytes,
            state_sync_interval: self.state_sync_interval(),
        }
    }

    pub fn pool_config(&self) -> crate::store::pool::PoolConfig {
        crate::store::pool::PoolConfig {
            size: self.db_pool_size,
            overflow: self.db_pool_overflow,
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
            recycle_after: Duration::from_secs(self.db_recycle_secs),
            health_check_on_acquire: self.db_health_check,
            leak_thresholds: LEAK_THRESHOLDS_SECS.map(Duration::from_secs),
        }
    }

    pub fn worker_config(&self, index: usize) -> crate::worker::WorkerConfig {
        crate::worker::WorkerConfig {
            group: self.group_name.clone(),
            consumer_id: format!("{}-{}", self.consumer_prefix, index),
            batch_size: self.batch_size,
            read_block: self.read_block(),
            claim_idle_threshold: self.claim_idle_threshold(),
            claim_sweep_interval: self.claim_sweep_interval(),
            retry_budget: self.retry_budget,
            retry_base_backoff: self.retry_base_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_stable_across_restarts() {
        let config = Config {
            database_url: "postgresql://localhost/logs".to_string(),
            queue_dir: PathBuf::from("/tmp/q"),
            stream_name: "logs:stream".to_string(),
            group_name: "log_workers".to_string(),
            queue_max_len: None,
            segment_roll_bytes: 8 * 1024 * 1024,
            state_sync_interval_ms: 200,
            workers: 4,
            consumer_prefix: "worker".to_string(),
            batch_size: 100,
            read_block_ms: 2000,
            claim_idle_ms: 60_000,
            claim_sweep_ms: 30_000,
            retry_budget: 3,
            retry_base_backoff_ms: 100,
            cache_ttl_query_secs: 300,
            cache_ttl_stats_secs: 60,
            retain_acked: 10_000,
            trim_sweep_ms: 60_000,
            db_pool_size: 10,
            db_pool_overflow: 5,
            db_acquire_timeout_secs: 30,
            db_recycle_secs: 3600,
            db_health_check: true,
        };
        let w0 = config.worker_config(0);
        assert_eq!(w0.consumer_id, "worker-0");
        assert_eq!(w0.batch_size, 100);
        assert_eq!(config.worker_config(3).consumer_id, "worker-3");
        assert_eq!(config.pool_config().size, 10);
        assert_eq!(config.pool_config().overflow, 5);
    }
}
