use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "log-collector",
        description = "Device log collection pipeline: HTTP ingest, durable queue, worker pool, PostgreSQL store"
    ),
    paths(
        crate::routes::logs::submit_log,
        crate::routes::logs::submit_batch,
        crate::routes::logs::query_device_logs,
        crate::routes::stats::get_stats,
        crate::routes::health::health,
    ),
    components(schemas(
        crate::record::LogSubmission,
        crate::record::LogRecord,
        crate::record::LogLevel,
        crate::record::TimestampInput,
        crate::routes::logs::SubmitResponse,
        crate::routes::logs::BatchRequest,
        crate::routes::logs::BatchItemOutcome,
        crate::routes::logs::BatchResponse,
        crate::routes::logs::DeviceLogsResponse,
        crate::routes::health::HealthResponse,
        crate::routes::health::DependencyHealth,
        crate::store::StoredLog,
    ))
)]
struct ApiDoc;

pub fn openapi_json() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(|| async { Json(openapi_json()) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_the_ingest_paths() {
        let doc = openapi_json();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/api/log"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/logs/batch"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/logs/{device_id}"));
        assert!(paths.iter().any(|p| p.as_str() == "/health"));
    }
}
