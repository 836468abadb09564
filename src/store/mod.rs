pub mod pool;

use crate::metrics::Metrics;
use crate::queue::QueueEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pool::{PgConnector, Pool, PoolConfig, PooledSession};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{Connection, Postgres, QueryBuilder};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out acquiring a database session after {0:?}")]
    AcquireTimeout(Duration),
    #[error("database connection failed: {0}")]
    Connect(String),
    #[error("record rejected by the store: {0}")]
    RejectedRecord(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let code = db.code();
            let code = code.as_deref().unwrap_or("");
            // Data exceptions (22xxx) and integrity violations (23xxx) are
            // properties of the record, not of the moment.
            if code.starts_with("22") || code.starts_with("23") {
                return StoreError::RejectedRecord(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

impl StoreError {
    /// Worth retrying with backoff: the database or the path to it hiccuped.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::AcquireTimeout(_) | StoreError::Connect(_) => true,
            StoreError::RejectedRecord(_) => false,
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    let code = db.code();
                    let code = code.as_deref().unwrap_or("");
                    // serialization_failure, deadlock_detected, connection
                    // exceptions, admin_shutdown, too_many_connections
                    code == "40001"
                        || code == "40P01"
                        || code == "57P01"
                        || code == "53300"
                        || code.starts_with("08")
                }
                _ => false,
            },
        }
    }

    /// The record itself is unacceptable (constraint or encoding violation);
    /// retrying the same bytes can never succeed.
    pub fn is_permanent_record_error(&self) -> bool {
        matches!(self, StoreError::RejectedRecord(_))
    }
}

/// The write surface the worker pool drains into. PostgreSQL implements it
/// below; tests substitute an in-memory store.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Insert a batch in one transaction, skipping ingest_id conflicts.
    /// Returns the number of rows actually inserted.
    async fn insert_batch(&self, entries: &[QueueEntry]) -> Result<u64, StoreError>;

    /// Insert one record in its own transaction. `Ok(false)` means a
    /// duplicate ingest_id was skipped.
    async fn insert_one(&self, entry: &QueueEntry) -> Result<bool, StoreError>;

    /// Quarantine a rejected record.
    async fn insert_dead_letter(
        &self,
        entry: &QueueEntry,
        error_code: &str,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct StoredLog {
    pub ingest_id: i64,
    pub device_id: String,
    pub log_level: String,
    pub message: String,
    pub log_data: Option<JsonValue>,
    pub ts: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LogStore {
    pool: Pool<PgConnector>,
    metrics: Arc<Metrics>,
}

impl LogStore {
    pub fn new(database_url: &str, pool_config: PoolConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            pool: Pool::new(PgConnector::new(database_url), pool_config),
            metrics,
        }
    }

    pub fn pool(&self) -> &Pool<PgConnector> {
        &self.pool
    }

    async fn acquire(&self) -> Result<PooledSession<PgConnector>, StoreError> {
        let started = Instant::now();
        let result = self.pool.acquire().await;
        self.metrics
            .pg_connection_acquire_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => {
                self.metrics.pg_connection_acquire_total.inc();
            }
            Err(_) => {
                self.metrics.pg_connection_acquire_errors_total.inc();
            }
        }
        result
    }

    /// Create tables and indexes if missing. The unique index on `ingest_id`
    /// is what makes re-delivered batches idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        const STATEMENTS: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS device_logs (
                id BIGSERIAL PRIMARY KEY,
                ingest_id BIGINT NOT NULL,
                device_id VARCHAR(50) NOT NULL,
                log_level VARCHAR(10) NOT NULL,
                message VARCHAR(1000) NOT NULL,
                log_data JSONB,
                ts TIMESTAMPTZ NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS device_logs_ingest_id_key
            ON device_logs (ingest_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS device_logs_device_ts_idx
            ON device_logs (device_id, ts DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter_logs (
                id BIGSERIAL PRIMARY KEY,
                ingest_id BIGINT NOT NULL,
                device_id VARCHAR(50) NOT NULL,
                payload JSONB NOT NULL,
                error_code TEXT NOT NULL,
                error_message TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                first_failed_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS dead_letter_logs_ingest_id_key
            ON dead_letter_logs (ingest_id)
            "#,
        ];

        let mut session = self.acquire().await?;
        for statement in STATEMENTS {
            if let Err(err) = sqlx::query(statement).execute(session.conn_mut()).await {
                session.release(false).await;
                return Err(err.into());
            }
        }
        session.release(true).await;
        Ok(())
    }

    pub async fn query_recent(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredLog>, StoreError> {
        let mut session = self.acquire().await?;
        let started = Instant::now();
        let result = query_recent_tx(session.conn_mut(), device_id, limit).await;
        self.metrics
            .store_query_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        match result {
            Ok(rows) => {
                session.release(true).await;
                Ok(rows)
            }
            Err(err) => {
                session.release(false).await;
                Err(err)
            }
        }
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let mut session = self.acquire().await?;
        let result = count_tx(session.conn_mut()).await;
        match result {
            Ok(count) => {
                session.release(true).await;
                Ok(count)
            }
            Err(err) => {
                session.release(false).await;
                Err(err)
            }
        }
    }

    /// Trivial liveness probe through the pool.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut session = self.acquire().await?;
        let result = sqlx::query("SELECT 1").execute(session.conn_mut()).await;
        match result {
            Ok(_) => {
                session.release(true).await;
                Ok(())
            }
            Err(err) => {
                session.release(false).await;
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl RecordStore for LogStore {
    async fn insert_batch(&self, entries: &[QueueEntry]) -> Result<u64, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut session = self.acquire().await?;
        let started = Instant::now();
        let result = insert_batch_tx(session.conn_mut(), entries).await;
        self.metrics
            .store_batch_insert_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        match result {
            Ok(inserted) => {
                if inserted < entries.len() as u64 {
                    tracing::warn!(
                        inserted,
                        skipped = entries.len() as u64 - inserted,
                        "skipped re-delivered duplicate rows"
                    );
                }
                session.release(true).await;
                Ok(inserted)
            }
            Err(err) => {
                session.release(false).await;
                Err(err)
            }
        }
    }

    async fn insert_one(&self, entry: &QueueEntry) -> Result<bool, StoreError> {
        let mut session = self.acquire().await?;
        let result = insert_batch_tx(session.conn_mut(), std::slice::from_ref(entry)).await;
        match result {
            Ok(inserted) => {
                session.release(true).await;
                Ok(inserted == 1)
            }
            Err(err) => {
                session.release(false).await;
                Err(err)
            }
        }
    }

    async fn insert_dead_letter(
        &self,
        entry: &QueueEntry,
        error_code: &str,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let mut session = self.acquire().await?;
        let result =
            insert_dead_letter_tx(session.conn_mut(), entry, error_code, error_message, retry_count)
                .await;
        match result {
            Ok(()) => {
                session.release(true).await;
                Ok(())
            }
            Err(err) => {
                session.release(false).await;
                Err(err)
            }
        }
    }
}

async fn insert_batch_tx(
    conn: &mut sqlx::PgConnection,
    entries: &[QueueEntry],
) -> Result<u64, StoreError> {
    let mut tx = conn.begin().await?;
    let inserted_at = Utc::now();

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO device_logs (ingest_id, device_id, log_level, message, log_data, ts, inserted_at) ",
    );
    builder.push_values(entries.iter(), |mut b, entry| {
        b.push_bind(entry.ingest_id as i64)
            .push_bind(&entry.record.device_id)
            .push_bind(entry.record.log_level.as_str())
            .push_bind(&entry.record.message)
            .push_bind(entry.record.log_data.clone().map(SqlJson))
            .push_bind(entry.record.timestamp)
            .push_bind(inserted_at);
    });
    builder.push(" ON CONFLICT (ingest_id) DO NOTHING");

    let result = builder.build().execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

async fn insert_dead_letter_tx(
    conn: &mut sqlx::PgConnection,
    entry: &QueueEntry,
    error_code: &str,
    error_message: &str,
    retry_count: u32,
) -> Result<(), StoreError> {
    let mut tx = conn.begin().await?;
    let payload = serde_json::to_value(entry.record.as_ref())
        .unwrap_or_else(|_| JsonValue::String(entry.record.message.clone()));
    sqlx::query(
        r#"
        INSERT INTO dead_letter_logs
            (ingest_id, device_id, payload, error_code, error_message, retry_count, first_failed_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (ingest_id) DO NOTHING
        "#,
    )
    .bind(entry.ingest_id as i64)
    .bind(&entry.record.device_id)
    .bind(SqlJson(payload))
    .bind(error_code)
    .bind(error_message)
    .bind(retry_count as i32)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn query_recent_tx(
    conn: &mut sqlx::PgConnection,
    device_id: &str,
    limit: i64,
) -> Result<Vec<StoredLog>, StoreError> {
    let mut tx = conn.begin().await?;
    let rows: Vec<StoredLog> = sqlx::query_as(
        r#"
        SELECT ingest_id, device_id, log_level, message, log_data, ts
        FROM device_logs
        WHERE device_id = $1
        ORDER BY ts DESC, ingest_id DESC
        LIMIT $2
        "#,
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

async fn count_tx(conn: &mut sqlx::PgConnection) -> Result<i64, StoreError> {
    let mut tx = conn.begin().await?;
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device_logs")
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(count)
}
