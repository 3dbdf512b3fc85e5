//! Request metrics: a dependency-injected Prometheus registry, the
//! per-route latency middleware, and the scrape endpoint.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// Histogram of request handling time in seconds, labeled by route template.
pub const REQUEST_DURATION_SECONDS: &str = "http_requests_duration_seconds";

/// Counter of handled requests, labeled by method and route template.
pub const REQUESTS_TOTAL: &str = "http_requests_total";

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Explicitly constructed Prometheus registry, passed to the server instead
/// of living in hidden global state.
///
/// Cloning is cheap and shares the underlying registry, so a clone given to
/// the middleware and a clone kept by the scrape endpoint observe the same
/// series.
#[derive(Clone)]
pub struct MetricsRegistry {
    recorder: Arc<PrometheusRecorder>,
}

impl MetricsRegistry {
    /// Build a registry with duration buckets suited to request latencies
    /// (5ms up to 10s).
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
                DURATION_BUCKETS,
            )
            .unwrap()
            .build_recorder();

        Self {
            recorder: Arc::new(recorder),
        }
    }

    /// Handle for rendering the scrape payload.
    pub fn handle(&self) -> PrometheusHandle {
        self.recorder.handle()
    }

    /// Render the current scrape payload in Prometheus text format.
    pub fn render(&self) -> String {
        self.recorder.handle().render()
    }

    /// Install this registry as the process-wide `metrics` recorder, so that
    /// macros used elsewhere in the application land here too.
    ///
    /// Optional top-level wiring; the latency middleware records through its
    /// own handle and does not need this.
    pub fn install_global(&self) {
        if metrics::set_global_recorder(self.clone()).is_err() {
            tracing::warn!("a global metrics recorder is already installed, keeping the existing one");
        }
    }

    pub(crate) fn observe_request(&self, method: &str, path: &str, elapsed_secs: f64) {
        let counter_labels = [("method", method.to_string()), ("path", path.to_string())];
        let histogram_labels = [("path", path.to_string())];

        metrics::with_local_recorder(self, || {
            metrics::counter!(REQUESTS_TOTAL, &counter_labels).increment(1);
            metrics::histogram!(REQUEST_DURATION_SECONDS, &histogram_labels).record(elapsed_secs);
        });
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder for MetricsRegistry {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.recorder.describe_counter(key, unit, description)
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.recorder.describe_gauge(key, unit, description)
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.recorder.describe_histogram(key, unit, description)
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> Counter {
        self.recorder.register_counter(key, metadata)
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> Gauge {
        self.recorder.register_gauge(key, metadata)
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> Histogram {
        self.recorder.register_histogram(key, metadata)
    }
}

/// Middleware to record per-route latency and request counts.
/// Someday tower-http might provide a metrics middleware: https://github.com/tower-rs/tower-http/issues/57
pub(crate) async fn track_requests(
    State(registry): State<MetricsRegistry>,
    req: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();

    // Label by the matched route template, never the raw request path: raw
    // paths have unbounded cardinality. Requests without a template (the 404
    // fallback) share the "" label.
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched_path| matched_path.as_str().to_owned())
        .unwrap_or_default();

    let method = req.method().clone();

    let response = next.run(req).await;

    registry.observe_request(method.as_str(), &path, start.elapsed().as_secs_f64());

    response
}

/// Router serving the Prometheus text exposition for `registry` at `/metrics`.
pub fn metrics_router(registry: &MetricsRegistry) -> Router {
    let handle = registry.handle();

    Router::new().route(
        "/metrics",
        get(move || std::future::ready(handle.render())),
    )
}
