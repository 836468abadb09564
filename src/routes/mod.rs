pub mod health;
pub mod logs;
pub mod metrics;
pub mod stats;

use axum::Router;

use crate::middleware::MetricsLayer;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let metrics_layer = MetricsLayer::new(state.metrics.clone());
    Router::new()
        .merge(health::router())
        .merge(metrics::router())
        .nest(
            "/api",
            Router::new()
                .merge(logs::router())
                .merge(stats::router())
                .merge(crate::openapi::router()),
        )
        .layer(metrics_layer)
        .with_state(state)
}

#[cfg(test)]
mod api_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value as JsonValue};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = crate::test_support::test_state();
        (router(state.clone()), state)
    }

    async fn body_json(response: axum::response::Response) -> JsonValue {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn submit_returns_queued_with_ingest_id() {
        let (app, _state) = app();
        let response = app
            .oneshot(post_json(
                "/api/log",
                json!({"device_id": "d1", "log_level": "INFO", "message": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["ingest_id"], 1);
    }

    #[tokio::test]
    async fn submit_ids_are_monotonic_across_requests() {
        let (app, _state) = app();
        let first = app
            .clone()
            .oneshot(post_json(
                "/api/log",
                json!({"device_id": "d1", "log_level": "INFO", "message": "a"}),
            ))
            .await
            .unwrap();
        let second = app
            .oneshot(post_json(
                "/api/log",
                json!({"device_id": "d2", "log_level": "ERROR", "message": "b"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(first).await["ingest_id"], 1);
        assert_eq!(body_json(second).await["ingest_id"], 2);
    }

    #[tokio::test]
    async fn submit_rejects_blank_device_id() {
        let (app, _state) = app();
        let response = app
            .oneshot(post_json(
                "/api/log",
                json!({"device_id": "", "log_level": "INFO", "message": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn submit_rejects_unknown_level() {
        let (app, state) = app();
        let response = app
            .oneshot(post_json(
                "/api/log",
                json!({"device_id": "d1", "log_level": "FOO", "message": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Nothing reached the queue.
        assert_eq!(state.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_reports_per_record_outcomes() {
        let (app, state) = app();
        let response = app
            .oneshot(post_json(
                "/api/logs/batch",
                json!({"logs": [
                    {"device_id": "d1", "log_level": "INFO", "message": "a"},
                    {"device_id": "", "log_level": "INFO", "message": "b"},
                    {"device_id": "d2", "log_level": "WARNING", "message": "c"},
                ]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["accepted"], 2);
        assert_eq!(body["rejected"], 1);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["status"], "queued");
        assert_eq!(results[0]["ingest_id"], 1);
        assert_eq!(results[1]["status"], "invalid");
        assert!(results[1]["error"].as_str().unwrap().contains("device_id"));
        assert_eq!(results[2]["ingest_id"], 2);
        // Only the valid records were enqueued.
        assert_eq!(state.queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn batch_rejects_empty_and_oversize() {
        let (app, _state) = app();
        let empty = app
            .clone()
            .oneshot(post_json("/api/logs/batch", json!({"logs": []})))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let oversize: Vec<JsonValue> = (0..1001)
            .map(|i| json!({"device_id": "d1", "log_level": "INFO", "message": format!("m{i}")}))
            .collect();
        let response = app
            .oneshot(post_json("/api/logs/batch", json!({"logs": oversize})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_of_exactly_max_len_is_accepted() {
        let (app, _state) = app();
        let logs: Vec<JsonValue> = (0..1000)
            .map(|i| json!({"device_id": "d1", "log_level": "DEBUG", "message": format!("m{i}")}))
            .collect();
        let response = app
            .oneshot(post_json("/api/logs/batch", json!({"logs": logs})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["accepted"], 1000);
    }

    #[tokio::test]
    async fn query_serves_cache_hits_without_the_store() {
        let (app, state) = app();
        // The store in tests is unreachable, so a hit proves the cache path.
        state.queue.cache().set_ex(
            "logs:d1:10",
            Duration::from_secs(300),
            json!([{"device_id": "d1", "message": "cached"}]),
        );
        let response = app
            .oneshot(get_req("/api/logs/d1?limit=10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["source"], "cache");
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["message"], "cached");
    }

    #[tokio::test]
    async fn query_with_limit_zero_returns_empty() {
        let (app, _state) = app();
        let response = app
            .oneshot(get_req("/api/logs/d1?limit=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["source"], "db");
        assert_eq!(body["count"], 0);
        assert_eq!(body["records"], json!([]));
    }

    #[tokio::test]
    async fn query_rejects_oversize_device_id() {
        let (app, _state) = app();
        let device = "d".repeat(60);
        let response = app
            .oneshot(get_req(&format!("/api/logs/{device}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_serves_cached_snapshot() {
        let (app, state) = app();
        state.queue.cache().set_ex(
            "stats:summary",
            Duration::from_secs(60),
            json!({"source": "live", "total_logs": 42}),
        );
        let response = app.oneshot(get_req("/api/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["source"], "cache");
        assert_eq!(body["total_logs"], 42);
    }

    #[tokio::test]
    async fn health_reports_per_dependency_detail() {
        let (app, _state) = app();
        let response = app.oneshot(get_req("/health")).await.unwrap();
        // The queue is live but the test store points at a dead endpoint.
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["queue"]["status"], "ok");
        assert_eq!(body["database"]["status"], "degraded");
        assert!(body["database"]["detail"].is_string());
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_series_after_traffic() {
        let (app, _state) = app();
        let _ = app
            .clone()
            .oneshot(post_json(
                "/api/log",
                json!({"device_id": "d1", "log_level": "INFO", "message": "x"}),
            ))
            .await
            .unwrap();
        let response = app.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("ingest_logs_total{level=\"INFO\"} 1"));
        assert!(text.contains("endpoint=\"/api/log\""));
    }
}
