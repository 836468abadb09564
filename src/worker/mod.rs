use crate::metrics::{Metrics, OutcomeLabels};
use crate::queue::{QueueEntry, QueueError, QueueHandle};
use crate::store::{RecordStore, StoreError};
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const OUTCOME_OK: OutcomeLabels = OutcomeLabels { outcome: "ok" };
const OUTCOME_RETRIED: OutcomeLabels = OutcomeLabels { outcome: "retried" };
const OUTCOME_FAILED: OutcomeLabels = OutcomeLabels { outcome: "failed" };
const OUTCOME_QUARANTINED: OutcomeLabels = OutcomeLabels {
    outcome: "quarantined",
};
const OUTCOME_COMMITTED: OutcomeLabels = OutcomeLabels {
    outcome: "committed",
};
const OUTCOME_DUPLICATE: OutcomeLabels = OutcomeLabels {
    outcome: "duplicate",
};
const OUTCOME_DEAD_LETTER: OutcomeLabels = OutcomeLabels {
    outcome: "dead_letter",
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: String,
    pub consumer_id: String,
    pub batch_size: usize,
    pub read_block: Duration,
    pub claim_idle_threshold: Duration,
    pub claim_sweep_interval: Duration,
    pub retry_budget: u32,
    pub retry_base_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            group: "log_workers".to_string(),
            consumer_id: consumer_id.into(),
            batch_size: 100,
            read_block: Duration::from_secs(2),
            claim_idle_threshold: Duration::from_secs(60),
            claim_sweep_interval: Duration::from_secs(30),
            retry_budget: 3,
            retry_base_backoff: Duration::from_millis(100),
        }
    }
}

/// Shared counters for the drain side of the pipeline, surfaced in
/// `/api/stats` and mirrored into Prometheus by the gauge poller.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub committed_total: AtomicU64,
    pub duplicates_total: AtomicU64,
    pub dead_lettered_total: AtomicU64,
    pub retries_total: AtomicU64,
    pub batches_total: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub last_commit_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error_message(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

struct WorkerContext {
    queue: QueueHandle,
    store: Arc<dyn RecordStore>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    metrics: Arc<Metrics>,
}

/// Spawn one consumer task. Shutdown is cooperative: the current batch is
/// finished and acked before the task exits; anything read but unprocessed
/// stays pending for this consumer id and is reclaimed on the next start.
pub fn spawn_worker(
    queue: QueueHandle,
    store: Arc<dyn RecordStore>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let ctx = WorkerContext {
        queue,
        store,
        config,
        stats,
        metrics,
    };
    tokio::spawn(async move {
        let consumer = ctx.config.consumer_id.clone();
        if let Err(err) = run(ctx, cancel).await {
            tracing::error!(consumer = %consumer, error = %err, "worker exited with error");
        }
    })
}

async fn run(ctx: WorkerContext, cancel: CancellationToken) -> Result<(), QueueError> {
    ctx.queue.ensure_group(&ctx.config.group).await?;
    adopt_own_pending(&ctx).await;

    tracing::info!(
        consumer = %ctx.config.consumer_id,
        group = %ctx.config.group,
        batch_size = ctx.config.batch_size,
        "worker started"
    );

    // The sweep deadline is checked between reads rather than raced against
    // them: a ticker arm would drop an in-flight read that may already have
    // been assigned entries. The read block keeps the check frequent enough.
    let mut last_sweep = std::time::Instant::now();
    loop {
        if last_sweep.elapsed() >= ctx.config.claim_sweep_interval {
            claim_sweep(&ctx).await;
            last_sweep = std::time::Instant::now();
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = ctx.queue.read_group(
                &ctx.config.group,
                &ctx.config.consumer_id,
                ctx.config.batch_size,
                ctx.config.read_block,
            ) => {
                match result {
                    Ok(batch) if !batch.is_empty() => process_batch(&ctx, batch).await,
                    Ok(_) => {}
                    Err(QueueError::Closed) => break,
                    Err(err) => {
                        ctx.stats.record_error(err.to_string());
                        tracing::warn!(consumer = %ctx.config.consumer_id, error = %err, "queue read failed");
                        tokio::time::sleep(ctx.config.retry_base_backoff).await;
                    }
                }
            }
        }
    }

    tracing::info!(consumer = %ctx.config.consumer_id, "worker stopped");
    Ok(())
}

/// Replay entries this consumer id was holding when it last died.
async fn adopt_own_pending(ctx: &WorkerContext) {
    let own = match ctx
        .queue
        .pending_ids_for(&ctx.config.group, &ctx.config.consumer_id)
        .await
    {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(error = %err, "failed to list own pending entries");
            return;
        }
    };
    if own.is_empty() {
        return;
    }
    tracing::info!(
        consumer = %ctx.config.consumer_id,
        count = own.len(),
        "replaying entries pending from a previous run"
    );
    match ctx
        .queue
        .claim(
            &ctx.config.group,
            &ctx.config.consumer_id,
            Duration::ZERO,
            Some(own),
        )
        .await
    {
        Ok(batch) if !batch.is_empty() => process_batch(ctx, batch).await,
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, "failed to claim own pending entries");
        }
    }
}

/// Adopt entries abandoned by consumers that stopped reading. The idle
/// threshold is far above normal in-flight time, so live consumers are never
/// robbed.
async fn claim_sweep(ctx: &WorkerContext) {
    let claimed = match ctx
        .queue
        .claim(
            &ctx.config.group,
            &ctx.config.consumer_id,
            ctx.config.claim_idle_threshold,
            None,
        )
        .await
    {
        Ok(claimed) => claimed,
        Err(err) => {
            tracing::warn!(consumer = %ctx.config.consumer_id, error = %err, "claim sweep failed");
            return;
        }
    };
    if claimed.is_empty() {
        return;
    }
    tracing::info!(
        consumer = %ctx.config.consumer_id,
        count = claimed.len(),
        "claimed idle entries from stalled consumers"
    );
    for chunk in claimed.chunks(ctx.config.batch_size) {
        process_batch(ctx, chunk.to_vec()).await;
    }
}

/// Persist one delivered batch and ack it. Acks happen strictly after the
/// insert transaction commits; on failure nothing is acked and the entries
/// stay pending for replay.
async fn process_batch(ctx: &WorkerContext, entries: Vec<QueueEntry>) {
    ctx.metrics.worker_batch_size.observe(entries.len() as f64);
    let mut attempt = 0u32;

    loop {
        match ctx.store.insert_batch(&entries).await {
            Ok(inserted) => {
                let duplicates = entries.len() as u64 - inserted;
                ack_entries(ctx, &entries).await;
                ctx.stats.committed_total.fetch_add(inserted, Ordering::Relaxed);
                ctx.stats
                    .duplicates_total
                    .fetch_add(duplicates, Ordering::Relaxed);
                ctx.stats.batches_total.fetch_add(1, Ordering::Relaxed);
                ctx.stats
                    .last_batch_len
                    .store(entries.len() as u64, Ordering::Relaxed);
                ctx.stats
                    .last_commit_unix_ms
                    .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
                ctx.stats.clear_error();
                ctx.metrics
                    .worker_logs_processed_total
                    .get_or_create(&OUTCOME_COMMITTED)
                    .inc_by(inserted);
                if duplicates > 0 {
                    ctx.metrics
                        .worker_logs_processed_total
                        .get_or_create(&OUTCOME_DUPLICATE)
                        .inc_by(duplicates);
                }
                ctx.metrics
                    .worker_batches_total
                    .get_or_create(&OUTCOME_OK)
                    .inc();
                tracing::debug!(
                    consumer = %ctx.config.consumer_id,
                    len = entries.len(),
                    inserted,
                    "batch committed"
                );
                return;
            }
            Err(err) if err.is_permanent_record_error() => {
                tracing::warn!(
                    consumer = %ctx.config.consumer_id,
                    error = %err,
                    "batch rejected; quarantining record by record"
                );
                ctx.metrics
                    .worker_batches_total
                    .get_or_create(&OUTCOME_QUARANTINED)
                    .inc();
                quarantine_batch(ctx, &entries).await;
                return;
            }
            Err(err) if err.is_transient() && attempt < ctx.config.retry_budget => {
                attempt += 1;
                ctx.stats.retries_total.fetch_add(1, Ordering::Relaxed);
                ctx.metrics
                    .worker_batches_total
                    .get_or_create(&OUTCOME_RETRIED)
                    .inc();
                let delay = backoff_delay(ctx.config.retry_base_backoff, attempt);
                tracing::warn!(
                    consumer = %ctx.config.consumer_id,
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient store error; retrying batch"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                // Budget exhausted or unclassified: leave the batch pending so
                // it replays through claim.
                ctx.stats.record_error(err.to_string());
                ctx.metrics
                    .worker_batches_total
                    .get_or_create(&OUTCOME_FAILED)
                    .inc();
                tracing::error!(
                    consumer = %ctx.config.consumer_id,
                    error = %err,
                    len = entries.len(),
                    "batch abandoned without ack"
                );
                return;
            }
        }
    }
}

/// Per-record fallback after a batch-level rejection: good records commit and
/// ack normally; the offenders land in the dead-letter table and are acked to
/// stop infinite replay. Transient failures leave the record pending.
async fn quarantine_batch(ctx: &WorkerContext, entries: &[QueueEntry]) {
    let mut to_ack = Vec::with_capacity(entries.len());
    for entry in entries {
        match ctx.store.insert_one(entry).await {
            Ok(inserted) => {
                to_ack.push(entry.ingest_id);
                if inserted {
                    ctx.stats.committed_total.fetch_add(1, Ordering::Relaxed);
                    ctx.metrics
                        .worker_logs_processed_total
                        .get_or_create(&OUTCOME_COMMITTED)
                        .inc();
                } else {
                    ctx.stats.duplicates_total.fetch_add(1, Ordering::Relaxed);
                    ctx.metrics
                        .worker_logs_processed_total
                        .get_or_create(&OUTCOME_DUPLICATE)
                        .inc();
                }
            }
            Err(err) if err.is_permanent_record_error() => {
                match ctx
                    .store
                    .insert_dead_letter(
                        entry,
                        permanent_error_code(&err),
                        &err.to_string(),
                        entry.delivery_count,
                    )
                    .await
                {
                    Ok(()) => {
                        to_ack.push(entry.ingest_id);
                        ctx.stats
                            .dead_lettered_total
                            .fetch_add(1, Ordering::Relaxed);
                        ctx.metrics
                            .worker_logs_processed_total
                            .get_or_create(&OUTCOME_DEAD_LETTER)
                            .inc();
                        tracing::warn!(
                            ingest_id = entry.ingest_id,
                            device = %entry.record.device_id,
                            error = %err,
                            "record quarantined to dead letter"
                        );
                    }
                    Err(dl_err) => {
                        // Keep the entry pending; it will come back around.
                        ctx.stats.record_error(dl_err.to_string());
                        tracing::error!(
                            ingest_id = entry.ingest_id,
                            error = %dl_err,
                            "failed to dead-letter record; leaving it pending"
                        );
                    }
                }
            }
            Err(err) => {
                ctx.stats.record_error(err.to_string());
                tracing::warn!(
                    ingest_id = entry.ingest_id,
                    error = %err,
                    "transient error during quarantine; leaving record pending"
                );
            }
        }
    }

    if !to_ack.is_empty() {
        let resolved: Vec<QueueEntry> = entries
            .iter()
            .filter(|entry| to_ack.contains(&entry.ingest_id))
            .cloned()
            .collect();
        ack_entries(ctx, &resolved).await;
    }
}

async fn ack_entries(ctx: &WorkerContext, entries: &[QueueEntry]) {
    let ids: Vec<u64> = entries.iter().map(|entry| entry.ingest_id).collect();
    if let Err(err) = ctx.queue.ack(&ctx.config.group, ids).await {
        // The rows are committed; a lost ack only means a redundant
        // redelivery that the unique ingest_id will absorb.
        tracing::warn!(error = %err, "failed to ack committed batch");
    }
}

fn permanent_error_code(err: &StoreError) -> &'static str {
    match err {
        StoreError::RejectedRecord(_) => "REJECTED_RECORD",
        _ => "PROCESSING_ERROR",
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(6);
    let exp = base.saturating_mul(1 << shift);
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
    exp + Duration::from_millis(jitter_ms)
}
