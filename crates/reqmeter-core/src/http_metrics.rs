//! The five built-in HTTP request metrics.

use crate::context::MetricsContext;
use crate::error::MetricsResult;
use crate::registry::{MetricHandle, MetricKind};

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const RESPONSES_TOTAL: &str = "responses_total";
pub const REQUESTS_PROCESSING_TIME: &str = "requests_processing_time_seconds";
pub const EXCEPTIONS_TOTAL: &str = "exceptions_total";
pub const REQUESTS_IN_PROGRESS: &str = "requests_in_progress";

pub const METHOD_LABEL: &str = "method";
pub const PATH_TEMPLATE_LABEL: &str = "path_template";
pub const STATUS_CODE_LABEL: &str = "status_code";
pub const EXCEPTION_TYPE_LABEL: &str = "exception_type";

/// Handles for the request metrics of one context.
#[derive(Debug, Clone)]
pub struct HttpMetrics {
    pub requests: MetricHandle,
    pub responses: MetricHandle,
    pub processing_time: MetricHandle,
    pub exceptions: MetricHandle,
    pub in_progress: MetricHandle,
}

impl HttpMetrics {
    pub(crate) fn register(ctx: &MetricsContext) -> MetricsResult<Self> {
        let base = [METHOD_LABEL, PATH_TEMPLATE_LABEL];
        Ok(Self {
            requests: ctx.register(
                MetricKind::Counter,
                REQUESTS_TOTAL,
                "Total count of requests by method and path.",
                &base,
            )?,
            responses: ctx.register(
                MetricKind::Counter,
                RESPONSES_TOTAL,
                "Total count of responses by method, path and status codes.",
                &[METHOD_LABEL, PATH_TEMPLATE_LABEL, STATUS_CODE_LABEL],
            )?,
            processing_time: ctx.register(
                MetricKind::Histogram,
                REQUESTS_PROCESSING_TIME,
                "Histogram of requests processing time by path (in seconds)",
                &base,
            )?,
            exceptions: ctx.register(
                MetricKind::Counter,
                EXCEPTIONS_TOTAL,
                "Total count of exceptions raised by path and exception type",
                &[METHOD_LABEL, PATH_TEMPLATE_LABEL, EXCEPTION_TYPE_LABEL],
            )?,
            in_progress: ctx.register(
                MetricKind::Gauge,
                REQUESTS_IN_PROGRESS,
                "Gauge of requests by method and path currently being processed",
                &base,
            )?,
        })
    }
}
