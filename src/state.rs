use crate::config::Config;
use crate::metrics::Metrics;
use crate::queue::QueueHandle;
use crate::store::LogStore;
use crate::worker::WorkerStats;
use axum::extract::FromRef;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub queue: QueueHandle,
    pub store: Arc<LogStore>,
    pub metrics: Arc<Metrics>,
    pub worker_stats: Arc<WorkerStats>,
}

impl FromRef<AppState> for QueueHandle {
    fn from_ref(state: &AppState) -> QueueHandle {
        state.queue.clone()
    }
}

impl FromRef<AppState> for Arc<Metrics> {
    fn from_ref(state: &AppState) -> Arc<Metrics> {
        state.metrics.clone()
    }
}
