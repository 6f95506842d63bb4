//! Timing wrapper for arbitrary async operations.

use std::future::Future;
use std::time::Instant;

use tracing::warn;

use crate::context::MetricsContext;
use crate::registry::{BoundMetric, MetricHandle};

/// Label used by the method-observe metrics.
pub const METHOD_OBSERVE_LABEL: &str = "method";

/// Time `fut` into `timing{method}`, tracking it in `inprogress{method}`
/// while it runs.
///
/// The metrics are recorded on every exit path: completion, cancellation
/// (the returned future is dropped) and panic. If metrics are disabled
/// when the returned future is first polled, `fut` runs untouched.
///
/// ```no_run
/// # async fn load() -> u32 { 1 }
/// # async fn demo() -> reqmeter_core::MetricsResult<()> {
/// use reqmeter_core::{MetricsContext, observe_metrics};
///
/// let ctx = MetricsContext::global();
/// let timing = ctx.register_method_observe_histogram("load_seconds", "Load time.")?;
/// let value = observe_metrics(ctx, "load", &timing, None, load()).await;
/// # let _ = value;
/// # Ok(())
/// # }
/// ```
pub fn observe_metrics<F: Future>(
    ctx: &MetricsContext,
    method: &str,
    timing: &MetricHandle,
    inprogress: Option<&MetricHandle>,
    fut: F,
) -> impl Future<Output = F::Output> + use<F> {
    let ctx = ctx.clone();
    let method = method.to_string();
    let timing = timing.clone();
    let inprogress = inprogress.cloned();

    async move {
        if !ctx.is_enabled() {
            return fut.await;
        }
        let _guard = TimingGuard::start(&ctx, &method, &timing, inprogress.as_ref());
        fut.await
    }
}

struct TimingGuard {
    start: Instant,
    timing: BoundMetric,
    inprogress: Option<BoundMetric>,
}

impl TimingGuard {
    fn start(
        ctx: &MetricsContext,
        method: &str,
        timing: &MetricHandle,
        inprogress: Option<&MetricHandle>,
    ) -> Self {
        let labels = [(METHOD_OBSERVE_LABEL, method)];
        let inprogress = inprogress.map(|handle| bind(ctx, handle, &labels));
        if let Some(gauge) = &inprogress {
            gauge.inc();
        }
        Self {
            start: Instant::now(),
            timing: bind(ctx, timing, &labels),
            inprogress,
        }
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        self.timing.observe(self.start.elapsed().as_secs_f64());
        if let Some(gauge) = &self.inprogress {
            gauge.dec();
        }
    }
}

fn bind(ctx: &MetricsContext, handle: &MetricHandle, labels: &[(&str, &str)]) -> BoundMetric {
    ctx.apply_labels(handle, labels).unwrap_or_else(|e| {
        warn!(metric = handle.name(), error = %e, "failed to bind observed metric");
        BoundMetric::noop()
    })
}
