//! reqmeter-core — request metrics for HTTP services.
//!
//! Keeps a registry of counters, gauges and histograms that all carry the
//! `service` and `pod` labels, observes HTTP requests through a
//! framework-independent protocol, and exposes the result in the
//! Prometheus text format (scrape endpoint or periodic file snapshot).
//!
//! # Architecture
//!
//! ```text
//! MetricsContext (global or explicit)
//!   ├── register() / apply_labels()  ← user metrics
//!   ├── start() / stop()             ← lifecycle, common labels
//!   ├── FileExporter                 → snapshot file every interval
//!   └── export()                     → text/plain for /metrics
//!
//! RequestObservation                 ← driven by reqmeter-axum / reqmeter-tower
//!   └── requests_total, responses_total, exceptions_total,
//!       requests_processing_time_seconds, requests_in_progress
//!
//! observe_metrics()                  ← time any future by method
//! ```
//!
//! The free functions below operate on [`MetricsContext::global`].

pub mod config;
pub mod context;
pub mod error;
pub mod exporter;
pub mod exposition;
pub mod filter;
pub mod http_metrics;
pub mod observe;
pub mod registry;
pub mod wrap;

pub use config::MetricsConfig;
pub use context::{CommonLabels, MetricsContext, StartOptions};
pub use error::{MetricsError, MetricsResult};
pub use exposition::CONTENT_TYPE_LATEST;
pub use filter::RouteFilter;
pub use http_metrics::HttpMetrics;
pub use observe::{
    Fault, PathTemplate, RequestAdapter, RequestObservation, RequestSpan, classify_panic,
    type_name_of,
};
pub use registry::{BoundMetric, MetricHandle, MetricKind};
pub use wrap::observe_metrics;

/// Register a metric on the global context.
pub fn register_metric(
    kind: MetricKind,
    name: &str,
    description: &str,
    labels: &[&str],
) -> MetricsResult<MetricHandle> {
    MetricsContext::global().register(kind, name, description, labels)
}

/// Register a `method`-labelled histogram on the global context.
pub fn register_method_observe_histogram(
    name: &str,
    description: &str,
) -> MetricsResult<MetricHandle> {
    MetricsContext::global().register_method_observe_histogram(name, description)
}

/// Register a `method`-labelled gauge on the global context.
pub fn register_method_observe_gauge(name: &str, description: &str) -> MetricsResult<MetricHandle> {
    MetricsContext::global().register_method_observe_gauge(name, description)
}

/// Bind a metric of the global context to label values.
pub fn apply_labels(handle: &MetricHandle, labels: &[(&str, &str)]) -> MetricsResult<BoundMetric> {
    MetricsContext::global().apply_labels(handle, labels)
}

/// Start the global context.
pub fn start_metrics(options: StartOptions) -> MetricsResult<()> {
    MetricsContext::global().start(options)
}

/// Stop the global context.
pub fn stop_metrics() {
    MetricsContext::global().stop();
}

/// Scrape body and content type of the global context.
pub fn export_to_http_response() -> MetricsResult<(Vec<u8>, &'static str)> {
    MetricsContext::global().export()
}
