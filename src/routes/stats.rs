use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::Ordering;

use crate::error::{map_queue_error, map_store_error, ApiResult};
use crate::state::AppState;

const STATS_KEY: &str = "stats:summary";

#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "stats",
    responses(
        (status = 200, description = "Pipeline aggregates (cached 60s)"),
        (status = 503, description = "Store unavailable")
    )
)]
pub(crate) async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<JsonValue>> {
    if let Some(mut cached) = state.queue.cache().get(STATS_KEY) {
        if let Some(object) = cached.as_object_mut() {
            object.insert("source".to_string(), json!("cache"));
        }
        return Ok(Json(cached));
    }

    let total_logs = state.store.count().await.map_err(map_store_error)?;
    let queue_status = state.queue.status().await.map_err(map_queue_error)?;
    let consumers = state
        .queue
        .pending_summary(&state.config.group_name)
        .await
        .unwrap_or_default();
    let workers = &state.worker_stats;

    let snapshot = json!({
        "source": "live",
        "total_logs": total_logs,
        "queue": {
            "stream": queue_status.stream_name,
            "length": queue_status.length,
            "pending_entries": queue_status.pending_entries,
            "next_ingest_id": queue_status.next_id,
            "consumers": consumers,
        },
        "workers": {
            "committed": workers.committed_total.load(Ordering::Relaxed),
            "duplicates": workers.duplicates_total.load(Ordering::Relaxed),
            "dead_lettered": workers.dead_lettered_total.load(Ordering::Relaxed),
            "retries": workers.retries_total.load(Ordering::Relaxed),
            "batches": workers.batches_total.load(Ordering::Relaxed),
            "last_batch_len": workers.last_batch_len.load(Ordering::Relaxed),
            "last_commit_unix_ms": workers.last_commit_unix_ms.load(Ordering::Relaxed),
            "last_error": workers.last_error_message(),
        },
    });
    state
        .queue
        .cache()
        .set_ex(STATS_KEY, state.config.cache_ttl_stats(), snapshot.clone());

    Ok(Json(snapshot))
}

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/stats", get(get_stats))
}
