use crate::store::StoreError;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Opens and probes raw database sessions. The pool is generic over this seam
/// so its acquisition discipline can be exercised without a live server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn, StoreError>;
    async fn ping(&self, conn: &mut Self::Conn) -> Result<(), StoreError>;
    async fn close(&self, conn: Self::Conn);
}

pub struct PgConnector {
    database_url: String,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, StoreError> {
        PgConnection::connect(&self.database_url)
            .await
            .map_err(|err| StoreError::Connect(err.to_string()))
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<(), StoreError> {
        conn.ping().await.map_err(StoreError::from)
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(err) = conn.close().await {
            tracing::debug!(error = %err, "error closing database session");
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub overflow: usize,
    pub acquire_timeout: Duration,
    pub recycle_after: Duration,
    pub health_check_on_acquire: bool,
    pub leak_thresholds: [Duration; 3],
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            overflow: 5,
            acquire_timeout: Duration::from_secs(30),
            recycle_after: Duration::from_secs(3600),
            health_check_on_acquire: true,
            leak_thresholds: [
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: usize,
    pub overflow: usize,
    pub in_use: usize,
    pub idle: usize,
}

struct IdleConn<T> {
    conn: T,
    created_at: Instant,
}

struct Lease {
    started: Instant,
    leak_counted: bool,
}

struct PoolShared<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn<C::Conn>>>,
    leases: Mutex<HashMap<u64, Lease>>,
    next_lease: AtomicU64,
    leaked_total: AtomicU64,
}

/// Bounded connection pool: at most `size + overflow` sessions exist at once,
/// idle capacity is capped at `size` so burst sessions close on release, and
/// every handout is optionally liveness-checked and age-recycled.
pub struct Pool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.size + config.overflow));
        Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                permits,
                idle: Mutex::new(Vec::new()),
                leases: Mutex::new(HashMap::new()),
                next_lease: AtomicU64::new(1),
                leaked_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease a session. The whole acquisition, including the capacity wait
    /// and any fresh connect or pre-handout ping, is bounded by
    /// `acquire_timeout`. Idle sessions past `recycle_after` are retired
    /// instead of re-leased.
    pub async fn acquire(&self) -> Result<PooledSession<C>, StoreError> {
        let deadline = self.shared.config.acquire_timeout;
        match timeout(deadline, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::AcquireTimeout(deadline)),
        }
    }

    async fn acquire_inner(&self) -> Result<PooledSession<C>, StoreError> {
        let shared = &self.shared;
        let permit = match shared.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(StoreError::Connect("pool is shut down".to_string())),
        };

        loop {
            let candidate = shared
                .idle
                .lock()
                .map_err(|_| StoreError::Connect("pool state poisoned".to_string()))?
                .pop();

            let (conn, created_at) = match candidate {
                Some(idle) => {
                    if idle.created_at.elapsed() >= shared.config.recycle_after {
                        shared.connector.close(idle.conn).await;
                        continue;
                    }
                    let mut conn = idle.conn;
                    if shared.config.health_check_on_acquire {
                        if let Err(err) = shared.connector.ping(&mut conn).await {
                            tracing::debug!(error = %err, "discarding dead pooled session");
                            shared.connector.close(conn).await;
                            continue;
                        }
                    }
                    (conn, idle.created_at)
                }
                None => (shared.connector.connect().await?, Instant::now()),
            };

            let lease_id = shared.next_lease.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut leases) = shared.leases.lock() {
                leases.insert(
                    lease_id,
                    Lease {
                        started: Instant::now(),
                        leak_counted: false,
                    },
                );
            }
            return Ok(PooledSession {
                conn: Some(conn),
                created_at,
                lease_id,
                shared: shared.clone(),
                _permit: permit,
            });
        }
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().map(|v| v.len()).unwrap_or(0);
        let in_use = self.shared.leases.lock().map(|v| v.len()).unwrap_or(0);
        PoolStats {
            size: self.shared.config.size,
            overflow: self.shared.config.overflow,
            in_use,
            idle,
        }
    }

    /// Age of every outstanding lease, for long-held threshold accounting.
    pub fn lease_ages(&self) -> Vec<Duration> {
        self.shared
            .leases
            .lock()
            .map(|leases| leases.values().map(|l| l.started.elapsed()).collect())
            .unwrap_or_default()
    }

    /// Count leases newly crossing `threshold` as leaks (each lease counts
    /// once) and return how many were marked by this scan.
    pub fn mark_leaks(&self, threshold: Duration) -> u64 {
        let Ok(mut leases) = self.shared.leases.lock() else {
            return 0;
        };
        let mut newly = 0;
        for lease in leases.values_mut() {
            if !lease.leak_counted && lease.started.elapsed() >= threshold {
                lease.leak_counted = true;
                newly += 1;
            }
        }
        drop(leases);
        if newly > 0 {
            self.shared.leaked_total.fetch_add(newly, Ordering::Relaxed);
        }
        newly
    }

    pub fn leaked_total(&self) -> u64 {
        self.shared.leaked_total.load(Ordering::Relaxed)
    }
}

/// A leased session. Call `release(ok)` when done; dropping without releasing
/// discards the connection (the permit still frees, so capacity is not lost).
pub struct PooledSession<C: Connector> {
    conn: Option<C::Conn>,
    created_at: Instant,
    lease_id: u64,
    shared: Arc<PoolShared<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> std::fmt::Debug for PooledSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("lease_id", &self.lease_id)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledSession<C> {
    pub fn conn_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("session already released")
    }

    /// Return the session to the pool. Error outcomes discard the connection;
    /// successful ones re-idle it unless the idle shelf is full (overflow) or
    /// the session has aged past the recycle horizon.
    pub async fn release(mut self, ok: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.end_lease();

        if !ok || self.created_at.elapsed() >= self.shared.config.recycle_after {
            self.shared.connector.close(conn).await;
            return;
        }

        let returned = match self.shared.idle.lock() {
            Ok(mut idle) if idle.len() < self.shared.config.size => {
                idle.push(IdleConn {
                    conn,
                    created_at: self.created_at,
                });
                None
            }
            Ok(_) => Some(conn),
            Err(_) => Some(conn),
        };
        if let Some(conn) = returned {
            self.shared.connector.close(conn).await;
        }
    }

    fn end_lease(&self) {
        if let Ok(mut leases) = self.shared.leases.lock() {
            leases.remove(&self.lease_id);
        }
    }
}

impl<C: Connector> Drop for PooledSession<C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            // Dropped without release: abandon the socket rather than re-pool
            // a session in an unknown state.
            self.end_lease();
        }
    }
}
