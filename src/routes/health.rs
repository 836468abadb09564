use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct DependencyHealth {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DependencyHealth {
    fn ok() -> Self {
        Self {
            status: "ok",
            detail: None,
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: "degraded",
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub queue: DependencyHealth,
    pub database: DependencyHealth,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Queue and store reachable", body = HealthResponse),
        (status = 503, description = "One or more dependencies down", body = HealthResponse)
    )
)]
pub(crate) async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue = match state.queue.status().await {
        Ok(_) => DependencyHealth::ok(),
        Err(err) => DependencyHealth::degraded(err.to_string()),
    };
    let database = match state.store.ping().await {
        Ok(()) => DependencyHealth::ok(),
        Err(err) => DependencyHealth::degraded(err.to_string()),
    };

    let healthy = queue.status == "ok" && database.status == "ok";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            queue,
            database,
        }),
    )
}

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
