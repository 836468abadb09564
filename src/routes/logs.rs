use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::error::{map_queue_error, map_store_error, ApiError, ApiResult};
use crate::metrics::{LevelLabels, OutcomeLabels};
use crate::queue::QueueError;
use crate::record::{LogRecord, LogSubmission, MAX_BATCH_LEN, MAX_DEVICE_ID_LEN};
use crate::state::AppState;

const DEFAULT_QUERY_LIMIT: u32 = 100;
const MAX_QUERY_LIMIT: u32 = 1000;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct SubmitResponse {
    pub status: &'static str,
    pub ingest_id: u64,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct BatchRequest {
    #[serde(default)]
    pub logs: Vec<LogSubmission>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct BatchItemOutcome {
    pub index: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct BatchResponse {
    pub status: &'static str,
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<BatchItemOutcome>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct DeviceLogsQuery {
    /// Maximum records to return (clamped to 1000).
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct DeviceLogsResponse {
    pub source: &'static str,
    pub count: usize,
    pub records: JsonValue,
}

/// Enqueue with the ingest retry budget. Capacity refusals are deterministic
/// and surface immediately; anything else gets jittered backoff.
async fn enqueue_with_retry(
    state: &AppState,
    records: Vec<LogRecord>,
) -> Result<Vec<u64>, ApiError> {
    let mut attempt = 0u32;
    loop {
        match state.queue.append(records.clone()).await {
            Ok(ids) => {
                state
                    .metrics
                    .queue_append_total
                    .get_or_create(&OutcomeLabels { outcome: "ok" })
                    .inc();
                return Ok(ids);
            }
            Err(err @ QueueError::Full { .. }) => {
                state
                    .metrics
                    .queue_append_total
                    .get_or_create(&OutcomeLabels { outcome: "error" })
                    .inc();
                return Err(map_queue_error(err));
            }
            Err(err) if attempt < state.config.retry_budget => {
                attempt += 1;
                let base = state.config.retry_base_backoff();
                let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
                let delay = base * 2u32.saturating_pow(attempt - 1) + Duration::from_millis(jitter_ms);
                tracing::warn!(error = %err, attempt, "queue append failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                state
                    .metrics
                    .queue_append_total
                    .get_or_create(&OutcomeLabels { outcome: "error" })
                    .inc();
                return Err(map_queue_error(err));
            }
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/log",
    tag = "logs",
    request_body = LogSubmission,
    responses(
        (status = 200, description = "Record queued", body = SubmitResponse),
        (status = 400, description = "Validation failure"),
        (status = 503, description = "Queue unavailable")
    )
)]
pub(crate) async fn submit_log(
    State(state): State<AppState>,
    Json(submission): Json<LogSubmission>,
) -> ApiResult<Json<SubmitResponse>> {
    let record = submission
        .validate(Utc::now())
        .map_err(ApiError::validation)?;
    let level = record.log_level.as_str();

    let ids = enqueue_with_retry(&state, vec![record]).await?;
    state
        .metrics
        .ingest_logs_total
        .get_or_create(&LevelLabels { level })
        .inc();

    Ok(Json(SubmitResponse {
        status: "queued",
        ingest_id: ids[0],
    }))
}

#[utoipa::path(
    post,
    path = "/api/logs/batch",
    tag = "logs",
    request_body = BatchRequest,
    responses(
        (status = 200, description = "Per-record outcomes", body = BatchResponse),
        (status = 400, description = "Batch size out of bounds"),
        (status = 503, description = "Queue unavailable")
    )
)]
pub(crate) async fn submit_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    let len = body.logs.len();
    if len == 0 || len > MAX_BATCH_LEN {
        return Err(ApiError::validation(format!(
            "batch size must be between 1 and {MAX_BATCH_LEN} (got {len})"
        )));
    }

    let now = Utc::now();
    let mut results = Vec::with_capacity(len);
    let mut records = Vec::new();
    let mut valid_indices = Vec::new();
    for (index, submission) in body.logs.into_iter().enumerate() {
        match submission.validate(now) {
            Ok(record) => {
                valid_indices.push(index);
                records.push(record);
                results.push(BatchItemOutcome {
                    index,
                    status: "queued",
                    ingest_id: None,
                    error: None,
                });
            }
            Err(message) => results.push(BatchItemOutcome {
                index,
                status: "invalid",
                ingest_id: None,
                error: Some(message),
            }),
        }
    }

    let accepted = records.len();
    if !records.is_empty() {
        let levels: Vec<&'static str> = records.iter().map(|r| r.log_level.as_str()).collect();
        let ids = enqueue_with_retry(&state, records).await?;
        for ((index, id), level) in valid_indices.into_iter().zip(ids).zip(levels) {
            results[index].ingest_id = Some(id);
            state
                .metrics
                .ingest_logs_total
                .get_or_create(&LevelLabels { level })
                .inc();
        }
    }

    Ok(Json(BatchResponse {
        status: "completed",
        accepted,
        rejected: len - accepted,
        results,
    }))
}

#[utoipa::path(
    get,
    path = "/api/logs/{device_id}",
    tag = "logs",
    params(
        ("device_id" = String, Path, description = "Device identifier"),
        DeviceLogsQuery
    ),
    responses(
        (status = 200, description = "Recent records, cache-through", body = DeviceLogsResponse),
        (status = 400, description = "Invalid device id"),
        (status = 503, description = "Store unavailable")
    )
)]
pub(crate) async fn query_device_logs(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<DeviceLogsQuery>,
) -> ApiResult<Json<DeviceLogsResponse>> {
    let device_id = device_id.trim().to_string();
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ApiError::validation(format!(
            "device_id must be 1..={MAX_DEVICE_ID_LEN} characters"
        )));
    }
    let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
    if limit == 0 {
        return Ok(Json(DeviceLogsResponse {
            source: "db",
            count: 0,
            records: JsonValue::Array(Vec::new()),
        }));
    }

    let key = format!("logs:{device_id}:{limit}");
    if let Some(cached) = state.queue.cache().get(&key) {
        let count = cached.as_array().map(|a| a.len()).unwrap_or(0);
        return Ok(Json(DeviceLogsResponse {
            source: "cache",
            count,
            records: cached,
        }));
    }

    let rows = state
        .store
        .query_recent(&device_id, limit as i64)
        .await
        .map_err(map_store_error)?;
    let count = rows.len();
    let records =
        serde_json::to_value(&rows).map_err(|err| ApiError::internal(err.to_string()))?;
    state
        .queue
        .cache()
        .set_ex(&key, state.config.cache_ttl_query(), records.clone());

    Ok(Json(DeviceLogsResponse {
        source: "db",
        count,
        records,
    }))
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/log", post(submit_log))
        .route("/logs/batch", post(submit_batch))
        .route("/logs/:device_id", get(query_device_logs))
}
