pub mod cache;
pub mod group;
mod stream;

pub use cache::TtlCache;
pub use group::ConsumerPending;

use crate::record::LogRecord;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue thread stopped")]
    Closed,
    #[error("queue is at capacity ({len} entries)")]
    Full { len: u64 },
    #[error("unknown consumer group: {0}")]
    UnknownGroup(String),
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// One delivered unit of work: the assigned ingest id plus the record payload.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub ingest_id: u64,
    pub delivery_count: u32,
    pub record: Arc<LogRecord>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QueueStatus {
    pub stream_name: String,
    pub length: u64,
    pub first_id: u64,
    pub next_id: u64,
    pub pending_entries: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub dir: PathBuf,
    pub stream_name: String,
    pub max_len: Option<u64>,
    pub segment_roll_bytes: u64,
    pub state_sync_interval: Duration,
}

impl QueueConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stream_name: "logs:stream".to_string(),
            max_len: None,
            segment_roll_bytes: 8 * 1024 * 1024,
            state_sync_interval: Duration::from_millis(200),
        }
    }
}

enum QueueCommand {
    Append {
        records: Vec<LogRecord>,
        respond_to: oneshot::Sender<Result<Vec<u64>, QueueError>>,
    },
    EnsureGroup {
        group: String,
        respond_to: oneshot::Sender<Result<(), QueueError>>,
    },
    ReadGroupOnce {
        group: String,
        consumer: String,
        count: usize,
        respond_to: oneshot::Sender<Result<Vec<QueueEntry>, QueueError>>,
    },
    Ack {
        group: String,
        ids: Vec<u64>,
        respond_to: oneshot::Sender<Result<u64, QueueError>>,
    },
    Claim {
        group: String,
        new_consumer: String,
        min_idle: Duration,
        ids: Option<Vec<u64>>,
        respond_to: oneshot::Sender<Result<Vec<QueueEntry>, QueueError>>,
    },
    PendingIdsFor {
        group: String,
        consumer: String,
        respond_to: oneshot::Sender<Result<Vec<u64>, QueueError>>,
    },
    PendingSummary {
        group: String,
        respond_to: oneshot::Sender<Result<Vec<ConsumerPending>, QueueError>>,
    },
    Status {
        respond_to: oneshot::Sender<QueueStatus>,
    },
    Trim {
        min_id: u64,
        respond_to: oneshot::Sender<Result<u64, QueueError>>,
    },
}

/// Cloneable async front to the queue thread. All file I/O happens on that
/// thread; callers only exchange messages with it.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
    notify: Arc<Notify>,
    cache: TtlCache,
}

impl QueueHandle {
    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Durably append records, returning their ingest ids in order. The whole
    /// batch is accepted or refused as a unit.
    pub async fn append(&self, records: Vec<LogRecord>) -> Result<Vec<u64>, QueueError> {
        self.send(|respond_to| QueueCommand::Append {
            records,
            respond_to,
        })
        .await?
    }

    pub async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        let group = group.to_string();
        self.send(|respond_to| QueueCommand::EnsureGroup { group, respond_to })
            .await?
    }

    /// Assign up to `count` undelivered entries to `consumer`, blocking up to
    /// `block_for` when the stream tail is empty.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_for: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let deadline = Instant::now() + block_for;
        loop {
            // Register interest before polling so an append that lands between
            // the poll and the wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let batch = self.read_group_once(group, consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(Vec::new());
            };
            let _ = tokio::time::timeout(remaining, &mut notified).await;
        }
    }

    pub async fn read_group_once(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        self.send(|respond_to| QueueCommand::ReadGroupOnce {
            group,
            consumer,
            count,
            respond_to,
        })
        .await?
    }

    /// Acknowledge processed entries; unknown ids are no-ops.
    pub async fn ack(&self, group: &str, ids: Vec<u64>) -> Result<u64, QueueError> {
        let group = group.to_string();
        self.send(|respond_to| QueueCommand::Ack {
            group,
            ids,
            respond_to,
        })
        .await?
    }

    /// Transfer pending entries idle for at least `min_idle` to
    /// `new_consumer`, returning them for reprocessing. `ids = None` scans
    /// every pending entry.
    pub async fn claim(
        &self,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        ids: Option<Vec<u64>>,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let group = group.to_string();
        let new_consumer = new_consumer.to_string();
        self.send(|respond_to| QueueCommand::Claim {
            group,
            new_consumer,
            min_idle,
            ids,
            respond_to,
        })
        .await?
    }

    pub async fn pending_ids_for(
        &self,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<u64>, QueueError> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        self.send(|respond_to| QueueCommand::PendingIdsFor {
            group,
            consumer,
            respond_to,
        })
        .await?
    }

    pub async fn pending_summary(&self, group: &str) -> Result<Vec<ConsumerPending>, QueueError> {
        let group = group.to_string();
        self.send(|respond_to| QueueCommand::PendingSummary { group, respond_to })
            .await?
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.send(|respond_to| QueueCommand::Status { respond_to })
            .await
    }

    pub async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.status().await?.length)
    }

    /// Trim acked entries below `min_id`, clamped so no pending or
    /// undelivered entry is ever removed. Returns the number trimmed.
    pub async fn trim(&self, min_id: u64) -> Result<u64, QueueError> {
        self.send(|respond_to| QueueCommand::Trim { min_id, respond_to })
            .await?
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueStateDisk {
    stream_id: String,
    stream_name: String,
    next_id: u64,
    first_id: u64,
    groups: Vec<group::GroupState>,
}

struct QueueRuntime {
    config: QueueConfig,
    state_path: PathBuf,
    stream: stream::StreamStore,
    groups: Vec<group::GroupState>,
    stream_id: Uuid,
    notify: Arc<Notify>,
    last_persist: Instant,
    dirty: bool,
}

/// Open the queue directory and start the queue thread. Recovery (state file,
/// segment scan, torn-tail truncation) happens here so startup errors surface
/// to the caller instead of dying inside the thread.
pub fn start(config: QueueConfig) -> Result<QueueHandle, QueueError> {
    fs::create_dir_all(&config.dir)
        .map_err(|err| QueueError::Storage(format!("create {}: {err}", config.dir.display())))?;
    let state_path = config.dir.join("state.json");
    let state = load_or_init_state(&state_path, &config.stream_name)?;
    let stream_id = Uuid::parse_str(&state.stream_id)
        .map_err(|err| QueueError::Storage(format!("invalid stream id in state: {err}")))?;

    let stream = stream::StreamStore::open(
        &config.dir,
        stream_id,
        state.next_id.max(1),
        state.first_id.max(1),
        config.segment_roll_bytes,
    )?;

    let mut groups = state.groups;
    for group in &mut groups {
        let dropped = group.drop_below(stream.first_id());
        if dropped > 0 {
            tracing::warn!(
                group = %group.name,
                dropped,
                "dropped pending entries whose records were trimmed before shutdown"
            );
        }
    }

    let notify = Arc::new(Notify::new());
    let cache = TtlCache::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();

    let mut runtime = QueueRuntime {
        state_path,
        stream,
        groups,
        stream_id,
        notify: notify.clone(),
        last_persist: Instant::now(),
        dirty: false,
        config,
    };
    runtime.persist_state()?;

    std::thread::Builder::new()
        .name("log-queue".to_string())
        .spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                runtime.handle(cmd);
            }
            if let Err(err) = runtime.flush_on_shutdown() {
                tracing::error!(error = %err, "queue state flush during shutdown failed");
            }
        })
        .map_err(|err| QueueError::Storage(format!("failed to spawn queue thread: {err}")))?;

    Ok(QueueHandle { tx, notify, cache })
}

impl QueueRuntime {
    fn handle(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Append {
                records,
                respond_to,
            } => {
                let _ = respond_to.send(self.append(records));
            }
            QueueCommand::EnsureGroup { group, respond_to } => {
                let _ = respond_to.send(self.ensure_group(&group));
            }
            QueueCommand::ReadGroupOnce {
                group,
                consumer,
                count,
                respond_to,
            } => {
                let _ = respond_to.send(self.read_group_once(&group, &consumer, count));
            }
            QueueCommand::Ack {
                group,
                ids,
                respond_to,
            } => {
                let _ = respond_to.send(self.ack(&group, &ids));
            }
            QueueCommand::Claim {
                group,
                new_consumer,
                min_idle,
                ids,
                respond_to,
            } => {
                let _ = respond_to.send(self.claim(&group, &new_consumer, min_idle, ids.as_deref()));
            }
            QueueCommand::PendingIdsFor {
                group,
                consumer,
                respond_to,
            } => {
                let result = self
                    .group(&group)
                    .map(|state| state.pending_ids_for(&consumer));
                let _ = respond_to.send(result);
            }
            QueueCommand::PendingSummary { group, respond_to } => {
                let now = Utc::now();
                let result = self.group(&group).map(|state| state.summary(now));
                let _ = respond_to.send(result);
            }
            QueueCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            QueueCommand::Trim { min_id, respond_to } => {
                let _ = respond_to.send(self.trim(min_id));
            }
        }
    }

    fn append(&mut self, records: Vec<LogRecord>) -> Result<Vec<u64>, QueueError> {
        if let Some(max_len) = self.config.max_len {
            let projected = self.stream.len() + records.len() as u64;
            if projected > max_len {
                return Err(QueueError::Full {
                    len: self.stream.len(),
                });
            }
        }

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.stream.append(record)?);
        }
        // Durable before the caller sees the ids.
        self.stream.sync()?;
        self.dirty = true;
        self.maybe_persist_state();
        self.notify.notify_waiters();
        Ok(ids)
    }

    fn ensure_group(&mut self, name: &str) -> Result<(), QueueError> {
        if self.groups.iter().any(|g| g.name == name) {
            return Ok(());
        }
        let start_after = self.stream.first_id().saturating_sub(1);
        self.groups.push(group::GroupState::new(name, start_after));
        self.persist_state()
    }

    fn read_group_once(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let cursor = self.group(group)?.last_delivered_id;
        let assigned = self.stream.range_after(cursor, count);
        if assigned.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<u64> = assigned.iter().map(|(id, _)| *id).collect();
        let state = self.group_mut(group)?;
        state.deliver(consumer, &ids, Utc::now());
        let entries = assigned
            .into_iter()
            .map(|(ingest_id, record)| QueueEntry {
                ingest_id,
                delivery_count: 1,
                record,
            })
            .collect();
        self.dirty = true;
        self.maybe_persist_state();
        Ok(entries)
    }

    fn ack(&mut self, group: &str, ids: &[u64]) -> Result<u64, QueueError> {
        let removed = self.group_mut(group)?.ack(ids);
        if removed > 0 {
            self.dirty = true;
            self.maybe_persist_state();
        }
        Ok(removed)
    }

    fn claim(
        &mut self,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        ids: Option<&[u64]>,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let now = Utc::now();
        let min_idle_ms = min_idle.as_millis() as u64;
        let claimed = self
            .group_mut(group)?
            .claim(new_consumer, min_idle_ms, ids, now);
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(claimed.len());
        for id in claimed {
            let delivery_count = self
                .group(group)?
                .delivery_count(id)
                .unwrap_or(1);
            match self.stream.get(id) {
                Some(record) => entries.push(QueueEntry {
                    ingest_id: id,
                    delivery_count,
                    record,
                }),
                None => {
                    // The trim clamp makes this unreachable short of on-disk
                    // tampering; drop the orphaned pending entry.
                    tracing::warn!(ingest_id = id, "pending entry has no record; discarding");
                    self.group_mut(group)?.ack(&[id]);
                }
            }
        }
        self.dirty = true;
        self.persist_state()?;
        Ok(entries)
    }

    fn trim(&mut self, min_id: u64) -> Result<u64, QueueError> {
        let floor = self
            .groups
            .iter()
            .map(|g| g.trim_floor())
            .min()
            .unwrap_or(self.stream.first_id());
        let clamped = min_id.min(floor);
        let removed = self.stream.trim(clamped)?;
        if removed > 0 {
            self.persist_state()?;
        }
        Ok(removed)
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            stream_name: self.config.stream_name.clone(),
            length: self.stream.len(),
            first_id: self.stream.first_id(),
            next_id: self.stream.next_id(),
            pending_entries: self.groups.iter().map(|g| g.pending_len()).sum(),
        }
    }

    fn group(&self, name: &str) -> Result<&group::GroupState, QueueError> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| QueueError::UnknownGroup(name.to_string()))
    }

    fn group_mut(&mut self, name: &str) -> Result<&mut group::GroupState, QueueError> {
        self.groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| QueueError::UnknownGroup(name.to_string()))
    }

    fn maybe_persist_state(&mut self) {
        if !self.dirty || self.last_persist.elapsed() < self.config.state_sync_interval {
            return;
        }
        if let Err(err) = self.persist_state() {
            tracing::warn!(error = %err, "failed to persist queue state");
        }
    }

    fn persist_state(&mut self) -> Result<(), QueueError> {
        let disk = QueueStateDisk {
            stream_id: self.stream_id.to_string(),
            stream_name: self.config.stream_name.clone(),
            next_id: self.stream.next_id(),
            first_id: self.stream.first_id(),
            groups: self.groups.clone(),
        };
        let tmp = self.state_path.with_extension("json.tmp");
        let encoded = serde_json::to_string_pretty(&disk)
            .map_err(|err| QueueError::Storage(format!("encode state: {err}")))?;
        fs::write(&tmp, encoded)
            .map_err(|err| QueueError::Storage(format!("write {}: {err}", tmp.display())))?;
        fs::rename(&tmp, &self.state_path)
            .map_err(|err| QueueError::Storage(format!("rename state: {err}")))?;
        self.last_persist = Instant::now();
        self.dirty = false;
        Ok(())
    }

    fn flush_on_shutdown(&mut self) -> Result<(), QueueError> {
        self.stream.sync()?;
        self.persist_state()
    }
}

fn load_or_init_state(path: &Path, stream_name: &str) -> Result<QueueStateDisk, QueueError> {
    if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|err| QueueError::Storage(format!("read {}: {err}", path.display())))?;
        let parsed: QueueStateDisk = serde_json::from_str(&raw)
            .map_err(|err| QueueError::Storage(format!("parse {}: {err}", path.display())))?;
        return Ok(parsed);
    }
    Ok(QueueStateDisk {
        stream_id: Uuid::new_v4().to_string(),
        stream_name: stream_name.to_string(),
        next_id: 1,
        first_id: 1,
        groups: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;

    fn record(device: &str, message: &str) -> LogRecord {
        LogRecord {
            device_id: device.to_string(),
            log_level: LogLevel::Info,
            message: message.to_string(),
            timestamp: Utc::now(),
            log_data: None,
        }
    }

    fn test_config(dir: &Path) -> QueueConfig {
        let mut config = QueueConfig::new(dir);
        config.segment_roll_bytes = 4 * 1024;
        config.state_sync_interval = Duration::from_millis(0);
        config
    }

    #[tokio::test]
    async fn append_returns_monotonic_ids_and_read_delivers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();

        let ids = queue
            .append(vec![record("d1", "a"), record("d1", "b")])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);

        let batch = queue
            .read_group("log_workers", "w0", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].ingest_id, 1);
        assert_eq!(batch[1].record.message, "b");

        // Already delivered; a second read sees nothing new.
        let empty = queue
            .read_group_once("log_workers", "w0", 10)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn ack_clears_pending_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        queue.append(vec![record("d1", "a")]).await.unwrap();
        let batch = queue
            .read_group_once("log_workers", "w0", 10)
            .await
            .unwrap();
        assert_eq!(queue.status().await.unwrap().pending_entries, 1);

        let ids: Vec<u64> = batch.iter().map(|e| e.ingest_id).collect();
        assert_eq!(queue.ack("log_workers", ids.clone()).await.unwrap(), 1);
        assert_eq!(queue.ack("log_workers", ids).await.unwrap(), 0);
        assert_eq!(queue.status().await.unwrap().pending_entries, 0);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();

        let reader = queue.clone();
        let read_task = tokio::spawn(async move {
            reader
                .read_group("log_workers", "w0", 10, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.append(vec![record("d1", "wake")]).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), read_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record.message, "wake");
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        let batch = queue
            .read_group("log_workers", "w0", 10, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn claim_transfers_idle_pending_entries_with_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        queue
            .append(vec![record("d1", "a"), record("d1", "b")])
            .await
            .unwrap();
        queue
            .read_group_once("log_workers", "dead", 10)
            .await
            .unwrap();

        // Not idle long enough.
        let none = queue
            .claim("log_workers", "alive", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert!(none.is_empty());

        let claimed = queue
            .claim("log_workers", "alive", Duration::ZERO, None)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].delivery_count, 2);
        assert_eq!(claimed[0].record.message, "a");

        let summary = queue.pending_summary("log_workers").await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].consumer, "alive");
        assert_eq!(summary[0].count, 2);
    }

    #[tokio::test]
    async fn pending_ids_scope_claims_to_one_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        queue
            .append(vec![record("d1", "a"), record("d1", "b")])
            .await
            .unwrap();
        queue
            .read_group_once("log_workers", "w0", 1)
            .await
            .unwrap();
        queue
            .read_group_once("log_workers", "w1", 1)
            .await
            .unwrap();

        let own = queue.pending_ids_for("log_workers", "w0").await.unwrap();
        assert_eq!(own, vec![1]);
        let claimed = queue
            .claim("log_workers", "w0", Duration::ZERO, Some(own))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        // w1's in-flight entry was untouched.
        assert_eq!(
            queue.pending_ids_for("log_workers", "w1").await.unwrap(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn trim_clamps_to_pending_floor() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        for i in 0..6 {
            queue
                .append(vec![record("d1", &format!("m{i}"))])
                .await
                .unwrap();
        }
        queue
            .read_group_once("log_workers", "w0", 4)
            .await
            .unwrap();
        queue.ack("log_workers", vec![1, 2]).await.unwrap();

        // 3 is the lowest pending entry; asking for more trims only 1 and 2.
        let removed = queue.trim(u64::MAX).await.unwrap();
        assert_eq!(removed, 2);
        let status = queue.status().await.unwrap();
        assert_eq!(status.first_id, 3);
        assert_eq!(status.length, 4);
    }

    #[tokio::test]
    async fn refuses_appends_past_max_len() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_len = Some(2);
        let queue = start(config).unwrap();
        queue.append(vec![record("d1", "a")]).await.unwrap();
        queue.append(vec![record("d1", "b")]).await.unwrap();
        let err = queue.append(vec![record("d1", "c")]).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { len: 2 }));
    }

    #[tokio::test]
    async fn read_from_unknown_group_fails() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        let err = queue
            .read_group_once("nope", "w0", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn restart_preserves_entries_pending_state_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = start(test_config(dir.path())).unwrap();
            queue.ensure_group("log_workers").await.unwrap();
            for i in 0..4 {
                queue
                    .append(vec![record("d1", &format!("m{i}"))])
                    .await
                    .unwrap();
            }
            queue
                .read_group_once("log_workers", "w0", 2)
                .await
                .unwrap();
            queue.ack("log_workers", vec![1]).await.unwrap();
            // Handle drop stops the thread and flushes state.
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queue = start(test_config(dir.path())).unwrap();
        let status = queue.status().await.unwrap();
        assert_eq!(status.next_id, 5);
        assert_eq!(status.pending_entries, 1);

        // Entry 2 is still pending for w0 and reclaimable; 3 and 4 are
        // undelivered and flow through a normal read.
        let own = queue.pending_ids_for("log_workers", "w0").await.unwrap();
        assert_eq!(own, vec![2]);
        let claimed = queue
            .claim("log_workers", "w0", Duration::ZERO, Some(own))
            .await
            .unwrap();
        assert_eq!(claimed[0].record.message, "m1");
        let fresh = queue
            .read_group_once("log_workers", "w0", 10)
            .await
            .unwrap();
        let ids: Vec<u64> = fresh.iter().map(|e| e.ingest_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        queue.append(vec![record("d1", "a")]).await.unwrap();
        queue.ensure_group("log_workers").await.unwrap();
        // Re-ensuring must not reset the cursor or duplicate the group.
        let batch = queue
            .read_group_once("log_workers", "w0", 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        queue.ensure_group("log_workers").await.unwrap();
        assert!(queue
            .read_group_once("log_workers", "w0", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cache_namespace_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let queue = start(test_config(dir.path())).unwrap();
        queue.cache().set_ex(
            "logs:d1:10",
            Duration::from_secs(300),
            serde_json::json!([1, 2]),
        );
        assert_eq!(
            queue.cache().get("logs:d1:10").unwrap(),
            serde_json::json!([1, 2])
        );
    }
}
