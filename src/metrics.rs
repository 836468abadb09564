use axum::http::Method;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: HttpMethod,
    pub endpoint: String,
    pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub method: HttpMethod,
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Other,
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => HttpMethod::Get,
            Method::POST => HttpMethod::Post,
            Method::PUT => HttpMethod::Put,
            Method::DELETE => HttpMethod::Delete,
            _ => HttpMethod::Other,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LevelLabels {
    pub level: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ThresholdLabels {
    pub threshold_seconds: u64,
}

fn latency_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 14))
}

/// All Prometheus series for the pipeline. Pool series keep the
/// `pg_pool_*` / `pg_connection_*` naming the dashboards already scrape.
pub struct Metrics {
    registry: Registry,

    pub http_requests_total: Family<HttpLabels, Counter>,
    pub http_request_duration_seconds: Family<EndpointLabels, Histogram>,

    pub ingest_logs_total: Family<LevelLabels, Counter>,
    pub queue_append_total: Family<OutcomeLabels, Counter>,
    pub queue_stream_length: Gauge,
    pub queue_pending_entries: Gauge,

    pub worker_logs_processed_total: Family<OutcomeLabels, Counter>,
    pub worker_batches_total: Family<OutcomeLabels, Counter>,
    pub worker_batch_size: Histogram,

    pub store_batch_insert_duration_seconds: Histogram,
    pub store_query_duration_seconds: Histogram,

    pub pg_pool_size: Gauge,
    pub pg_pool_in_use_connections: Gauge,
    pub pg_pool_available_connections: Gauge,
    pub pg_connection_acquire_total: Counter,
    pub pg_connection_acquire_errors_total: Counter,
    pub pg_connection_acquire_duration_seconds: Histogram,
    pub pg_connection_long_held: Family<ThresholdLabels, Gauge>,
    pub pg_connection_leaked_total: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds = Family::<EndpointLabels, Histogram>::new_with_constructor(
            latency_histogram as fn() -> Histogram,
        );
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency",
            http_request_duration_seconds.clone(),
        );

        let ingest_logs_total = Family::<LevelLabels, Counter>::default();
        registry.register(
            "ingest_logs",
            "Log records accepted for ingestion, by level",
            ingest_logs_total.clone(),
        );

        let queue_append_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "queue_append",
            "Queue append attempts by outcome",
            queue_append_total.clone(),
        );

        let queue_stream_length = Gauge::default();
        registry.register(
            "queue_stream_length",
            "Entries currently retained in the queue stream",
            queue_stream_length.clone(),
        );

        let queue_pending_entries = Gauge::default();
        registry.register(
            "queue_pending_entries",
            "Entries delivered to a consumer and not yet acknowledged",
            queue_pending_entries.clone(),
        );

        let worker_logs_processed_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "worker_logs_processed",
            "Records processed by workers, by outcome",
            worker_logs_processed_total.clone(),
        );

        let worker_batches_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "worker_batches",
            "Worker batches by outcome",
            worker_batches_total.clone(),
        );

        let worker_batch_size = Histogram::new([1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0].into_iter());
        registry.register(
            "worker_batch_size",
            "Records per worker batch",
            worker_batch_size.clone(),
        );

        let store_batch_insert_duration_seconds =
            Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "store_batch_insert_duration_seconds",
            "Batch insert transaction latency",
            store_batch_insert_duration_seconds.clone(),
        );

        let store_query_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "store_query_duration_seconds",
            "Device query latency",
            store_query_duration_seconds.clone(),
        );

        let pg_pool_size = Gauge::default();
        registry.register(
            "pg_pool_size",
            "Configured steady-state size of the connection pool",
            pg_pool_size.clone(),
        );

        let pg_pool_in_use_connections = Gauge::default();
        registry.register(
            "pg_pool_in_use_connections",
            "Connections currently leased from the pool",
            pg_pool_in_use_connections.clone(),
        );

        let pg_pool_available_connections = Gauge::default();
        registry.register(
            "pg_pool_available_connections",
            "Idle connections available in the pool",
            pg_pool_available_connections.clone(),
        );

        let pg_connection_acquire_total = Counter::default();
        registry.register(
            "pg_connection_acquire",
            "Successful pool acquisitions",
            pg_connection_acquire_total.clone(),
        );

        let pg_connection_acquire_errors_total = Counter::default();
        registry.register(
            "pg_connection_acquire_errors",
            "Failed pool acquisitions (timeout or connect error)",
            pg_connection_acquire_errors_total.clone(),
        );

        let pg_connection_acquire_duration_seconds =
            Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "pg_connection_acquire_duration_seconds",
            "Time taken to acquire a connection from the pool",
            pg_connection_acquire_duration_seconds.clone(),
        );

        let pg_connection_long_held = Family::<ThresholdLabels, Gauge>::default();
        registry.register(
            "pg_connection_long_held",
            "Connections held longer than each threshold",
            pg_connection_long_held.clone(),
        );

        let pg_connection_leaked_total = Counter::default();
        registry.register(
            "pg_connection_leaked",
            "Total number of potentially leaked connections",
            pg_connection_leaked_total.clone(),
        );

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            ingest_logs_total,
            queue_append_total,
            queue_stream_length,
            queue_pending_entries,
            worker_logs_processed_total,
            worker_batches_total,
            worker_batch_size,
            store_batch_insert_duration_seconds,
            store_query_duration_seconds,
            pg_pool_size,
            pg_pool_in_use_connections,
            pg_pool_available_connections,
            pg_connection_acquire_total,
            pg_connection_acquire_errors_total,
            pg_connection_acquire_duration_seconds,
            pg_connection_long_held,
            pg_connection_leaked_total,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("metric encoding is infallible");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_pipeline_series() {
        let metrics = Metrics::new();
        metrics
            .ingest_logs_total
            .get_or_create(&LevelLabels { level: "INFO" })
            .inc();
        metrics.queue_stream_length.set(7);

        let encoded = metrics.encode();
        assert!(encoded.contains("http_requests_total"));
        assert!(encoded.contains("ingest_logs_total{level=\"INFO\"} 1"));
        assert!(encoded.contains("queue_stream_length 7"));
        assert!(encoded.contains("pg_connection_leaked_total 0"));
    }

    #[test]
    fn maps_http_methods() {
        assert!(matches!(HttpMethod::from(&Method::GET), HttpMethod::Get));
        assert!(matches!(HttpMethod::from(&Method::PATCH), HttpMethod::Other));
    }
}
