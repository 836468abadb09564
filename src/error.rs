use crate::queue::QueueError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Client-visible error: HTTP status plus a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION", message)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "BACKEND_UNAVAILABLE",
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, code = self.code, message = %self.message, "request failed");
        }
        let body = serde_json::json!({
            "status": "error",
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn map_queue_error(err: QueueError) -> ApiError {
    match &err {
        QueueError::Full { .. } => ApiError::backend_unavailable(err.to_string()),
        QueueError::Closed => ApiError::backend_unavailable("queue is shutting down"),
        _ => ApiError::internal(err.to_string()),
    }
}

pub fn map_store_error(err: StoreError) -> ApiError {
    match &err {
        StoreError::AcquireTimeout(_) | StoreError::Connect(_) => {
            ApiError::backend_unavailable(err.to_string())
        }
        _ => ApiError::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_maps_to_service_unavailable() {
        let err = map_queue_error(QueueError::Full { len: 10 });
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "BACKEND_UNAVAILABLE");
    }

    #[test]
    fn store_timeout_maps_to_service_unavailable() {
        let err = map_store_error(StoreError::AcquireTimeout(std::time::Duration::from_secs(30)));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn storage_errors_map_to_internal() {
        let err = map_queue_error(QueueError::Storage("disk gone".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
