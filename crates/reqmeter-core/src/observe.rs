//! Request observation — the state machine shared by every framework
//! adapter.
//!
//! An adapter resolves the request's path template, calls
//! [`RequestObservation::begin`], forwards the request, and reports the
//! lifecycle events it sees:
//!
//! ```text
//! begin()              requests_in_progress +1, requests_total +1
//!   │
//!   ├─ response_started(status)
//!   ├─ response_completed()      end of body; duration captured
//!   ├─ fault(exception_type)     exceptions_total +1, status → 500
//!   │
//! finish() / drop      histogram (if completed), responses_total +1,
//!                      requests_in_progress -1   (exactly once)
//! ```
//!
//! Direct-return frameworks call `response_started` and
//! `response_completed` back to back; streaming adapters call
//! `response_completed` only once the body has been fully sent.

use std::any::Any;
use std::borrow::Cow;
use std::time::{Duration, Instant};

use http::Request;
use tracing::warn;

use crate::context::MetricsContext;
use crate::http_metrics::{
    EXCEPTION_TYPE_LABEL, HttpMetrics, METHOD_LABEL, PATH_TEMPLATE_LABEL, STATUS_CODE_LABEL,
};
use crate::registry::{BoundMetric, MetricHandle};

/// Status recorded until the application produces one.
pub const SERVER_ERROR_STATUS: u16 = 500;

/// Exception type recorded for a panic without a [`Fault`] payload.
pub const PANIC_EXCEPTION_TYPE: &str = "panic";

/// The route pattern a request matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    /// The template (`/users/{id}`), or the raw path if unmatched.
    pub value: String,
    /// Whether the request matched a known route.
    pub is_handled: bool,
}

impl PathTemplate {
    pub fn handled(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_handled: true,
        }
    }

    pub fn unhandled(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_handled: false,
        }
    }
}

/// Framework-specific route resolution.
pub trait RequestAdapter<B> {
    /// Resolve the request to the route template it matched, using the
    /// framework's own routing.
    fn resolve_path_template(&self, request: &Request<B>) -> PathTemplate;
}

/// Marks a response (via its extensions) or a panic payload as the result
/// of an application fault.
///
/// Applications that turn their own errors into responses can attach a
/// `Fault` so the exception is still counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    exception_type: Cow<'static, str>,
}

impl Fault {
    pub fn new(exception_type: impl Into<Cow<'static, str>>) -> Self {
        Self {
            exception_type: exception_type.into(),
        }
    }

    /// A fault named after type `T`.
    pub fn of<T: ?Sized>() -> Self {
        Self::new(type_name_of::<T>())
    }

    pub fn exception_type(&self) -> &str {
        &self.exception_type
    }
}

/// Short name of a type: module path and generic arguments stripped.
pub fn type_name_of<T: ?Sized>() -> &'static str {
    short_type_name(std::any::type_name::<T>())
}

/// `my_app::errors::ValueError` → `ValueError`,
/// `alloc::boxed::Box<dyn Error>` → `Box`.
pub fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Exception type for a caught panic payload.
pub fn classify_panic(payload: &(dyn Any + Send)) -> Cow<'static, str> {
    match payload.downcast_ref::<Fault>() {
        Some(fault) => fault.exception_type.clone(),
        None => Cow::Borrowed(PANIC_EXCEPTION_TYPE),
    }
}

/// Per-request timing and status.
#[derive(Debug, Clone)]
pub struct RequestSpan {
    start: Instant,
    end: Option<Instant>,
    status_code: u16,
    duration: Duration,
}

impl RequestSpan {
    fn start() -> Self {
        Self {
            start: Instant::now(),
            end: None,
            status_code: SERVER_ERROR_STATUS,
            duration: Duration::ZERO,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Zero until the response has completed.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    fn complete(&mut self) {
        if self.end.is_none() {
            let end = Instant::now();
            self.duration = end - self.start;
            self.end = Some(end);
        }
    }
}

/// One observed request.
///
/// Dropping it without calling [`finish`](Self::finish) still records the
/// response and releases the in-flight gauge, so cancellation and panics
/// cannot leak an in-flight request.
pub struct RequestObservation {
    ctx: MetricsContext,
    metrics: HttpMetrics,
    method: String,
    path_template: String,
    span: RequestSpan,
    finished: bool,
}

impl RequestObservation {
    /// Start observing a request, or return `None` if it should pass
    /// through untouched.
    pub fn begin(ctx: &MetricsContext, method: &str, path_template: &PathTemplate) -> Option<Self> {
        if !ctx.should_observe(path_template) {
            return None;
        }
        let metrics = match ctx.http_metrics() {
            Ok(metrics) => metrics.clone(),
            Err(e) => {
                warn!(error = %e, "request metrics unavailable");
                return None;
            }
        };

        let observation = Self {
            ctx: ctx.clone(),
            metrics,
            method: method.to_string(),
            path_template: path_template.value.clone(),
            span: RequestSpan::start(),
            finished: false,
        };
        observation.bound(&observation.metrics.in_progress, None).inc();
        observation.bound(&observation.metrics.requests, None).inc();
        Some(observation)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path_template(&self) -> &str {
        &self.path_template
    }

    pub fn span(&self) -> &RequestSpan {
        &self.span
    }

    /// The response head is available.
    pub fn response_started(&mut self, status_code: u16) {
        self.span.status_code = status_code;
    }

    /// The response has been fully produced.
    pub fn response_completed(&mut self) {
        self.span.complete();
    }

    /// The application failed with a fault of the given type.
    pub fn fault(&mut self, exception_type: &str) {
        self.bound(
            &self.metrics.exceptions,
            Some((EXCEPTION_TYPE_LABEL, exception_type)),
        )
        .inc();
        self.span.status_code = SERVER_ERROR_STATUS;
    }

    /// Record the terminal metrics now.
    pub fn finish(mut self) {
        self.record_finish();
    }

    fn record_finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.span.is_complete() {
            self.bound(&self.metrics.processing_time, None)
                .observe(self.span.duration.as_secs_f64());
        }
        let status = self.span.status_code.to_string();
        self.bound(&self.metrics.responses, Some((STATUS_CODE_LABEL, status.as_str())))
            .inc();
        self.bound(&self.metrics.in_progress, None).dec();
    }

    fn bound(&self, handle: &MetricHandle, extra: Option<(&str, &str)>) -> BoundMetric {
        if !self.ctx.is_enabled() {
            return BoundMetric::noop();
        }
        let mut labels = vec![
            (METHOD_LABEL, self.method.as_str()),
            (PATH_TEMPLATE_LABEL, self.path_template.as_str()),
        ];
        labels.extend(extra);
        match self.ctx.apply_labels(handle, &labels) {
            Ok(bound) => bound,
            Err(e) => {
                warn!(metric = handle.name(), error = %e, "failed to bind request metric");
                BoundMetric::noop()
            }
        }
    }
}

impl Drop for RequestObservation {
    fn drop(&mut self) {
        self.record_finish();
    }
}
