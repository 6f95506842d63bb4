//! Metrics context — the state shared by the registry, the exporter and
//! every framework adapter.
//!
//! A `MetricsContext` is cheap to clone (`Arc` inside) and is threaded
//! explicitly into adapters. [`MetricsContext::global`] provides the
//! process-wide instance behind the crate's free-function API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};
use prometheus::Registry;
use prometheus::proto::MetricFamily;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::{MetricsError, MetricsResult};
use crate::exporter::FileExporter;
use crate::exposition::{self, CONTENT_TYPE_LATEST};
use crate::filter::RouteFilter;
use crate::http_metrics::HttpMetrics;
use crate::observe::PathTemplate;
use crate::registry::{self, BoundMetric, MetricHandle, MetricKind, MetricStore};

/// Label identifying the service.
pub const SERVICE_LABEL: &str = "service";
/// Label identifying the running instance.
pub const POD_LABEL: &str = "pod";
/// Labels prepended to every registered metric.
pub const COMMON_LABELS: [&str; 2] = [SERVICE_LABEL, POD_LABEL];

/// `service` value until one is configured.
pub const DEFAULT_SERVICE_NAME: &str = "undefined";
/// Default pause between file snapshots.
pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

static GLOBAL: Lazy<MetricsContext> = Lazy::new(MetricsContext::new);

/// Options for [`MetricsContext::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    /// Value of the `service` label. Empty keeps the current value.
    pub service_name: String,
    /// Value of the `pod` label. Empty keeps the current value
    /// (the host name, or a random id if there is none).
    pub instance_id: String,
    pub enabled: bool,
    pub write_to_file: bool,
    pub file_path: Option<PathBuf>,
    pub interval: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            instance_id: String::new(),
            enabled: true,
            write_to_file: false,
            file_path: None,
            interval: DEFAULT_EXPORT_INTERVAL,
        }
    }
}

impl StartOptions {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Also write snapshots to `path` every `interval`.
    pub fn write_to_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.write_to_file = true;
        self.file_path = Some(path.into());
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Values of the common labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonLabels {
    pub service: String,
    pub pod: String,
}

impl Default for CommonLabels {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE_NAME.to_string(),
            pod: default_instance_id(),
        }
    }
}

/// Host name, or a random UUID when the host has none.
pub fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[derive(Default)]
struct LiveRegistry {
    registry: Option<Registry>,
    /// Set between `start` and `stop`.
    active: bool,
}

struct ContextInner {
    enabled: AtomicBool,
    store: RwLock<MetricStore>,
    live: RwLock<LiveRegistry>,
    labels: RwLock<CommonLabels>,
    filter: RwLock<Arc<RouteFilter>>,
    exporter: Mutex<Option<FileExporter>>,
    http: OnceCell<HttpMetrics>,
}

/// Shared metrics state: registry, common labels, route filter, exporter.
#[derive(Clone)]
pub struct MetricsContext {
    inner: Arc<ContextInner>,
}

impl Default for MetricsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsContext {
    /// A fresh, disabled context with no metrics registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                enabled: AtomicBool::new(false),
                store: RwLock::new(MetricStore::default()),
                live: RwLock::new(LiveRegistry::default()),
                labels: RwLock::new(CommonLabels::default()),
                filter: RwLock::new(Arc::new(RouteFilter::default())),
                exporter: Mutex::new(None),
                http: OnceCell::new(),
            }),
        }
    }

    /// The process-wide context.
    pub fn global() -> &'static MetricsContext {
        &GLOBAL
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    // ── Registration ───────────────────────────────────────────

    pub fn register(
        &self,
        kind: MetricKind,
        name: &str,
        description: &str,
        labels: &[&str],
    ) -> MetricsResult<MetricHandle> {
        self.register_inner(kind, name, description, labels, None)
    }

    /// Register a histogram with explicit bucket upper bounds.
    pub fn register_histogram_with_buckets(
        &self,
        name: &str,
        description: &str,
        labels: &[&str],
        buckets: Vec<f64>,
    ) -> MetricsResult<MetricHandle> {
        self.register_inner(MetricKind::Histogram, name, description, labels, Some(buckets))
    }

    /// Histogram labelled only by `method`, for [`observe_metrics`](crate::observe_metrics).
    pub fn register_method_observe_histogram(
        &self,
        name: &str,
        description: &str,
    ) -> MetricsResult<MetricHandle> {
        self.register(MetricKind::Histogram, name, description, &["method"])
    }

    /// Gauge labelled only by `method`, for [`observe_metrics`](crate::observe_metrics).
    pub fn register_method_observe_gauge(
        &self,
        name: &str,
        description: &str,
    ) -> MetricsResult<MetricHandle> {
        self.register(MetricKind::Gauge, name, description, &["method"])
    }

    fn register_inner(
        &self,
        kind: MetricKind,
        name: &str,
        description: &str,
        labels: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> MetricsResult<MetricHandle> {
        let handle = write(&self.inner.store).register(kind, name, description, labels, buckets)?;

        // Already started: join the live registry right away.
        let live = read(&self.inner.live);
        if let (true, Some(registry)) = (live.active, live.registry.as_ref()) {
            join_registry(registry, &handle);
        }

        debug!(metric = name, %kind, "metric registered");
        Ok(handle)
    }

    /// Look up a registered metric by name.
    pub fn metric(&self, name: &str) -> Option<MetricHandle> {
        read(&self.inner.store).get(name).cloned()
    }

    // ── Recording ──────────────────────────────────────────────

    /// Bind a metric to label values, merged with the common labels.
    ///
    /// The keys of `labels` must be exactly the labels declared at
    /// registration. While disabled this returns a no-op view without
    /// validating anything.
    pub fn apply_labels(
        &self,
        handle: &MetricHandle,
        labels: &[(&str, &str)],
    ) -> MetricsResult<BoundMetric> {
        if !self.is_enabled() {
            return Ok(BoundMetric::noop());
        }

        let store = read(&self.inner.store);
        let declared = store
            .declared_labels(handle.id())
            .ok_or_else(|| MetricsError::UnknownMetric(handle.name().to_string()))?;

        let common = read(&self.inner.labels).clone();
        let mut values: Vec<&str> = Vec::with_capacity(declared.len() + COMMON_LABELS.len());
        values.push(&common.service);
        values.push(&common.pod);

        let mismatch = || MetricsError::LabelMismatch {
            metric: handle.name().to_string(),
            expected: declared.to_vec(),
            got: labels.iter().map(|(k, _)| k.to_string()).collect(),
        };
        if labels.len() != declared.len() {
            return Err(mismatch());
        }
        for name in declared {
            let value = labels
                .iter()
                .find(|(k, _)| *k == name.as_str())
                .map(|(_, v)| *v)
                .ok_or_else(mismatch)?;
            values.push(value);
        }

        handle.bind(&values)
    }

    pub fn common_labels(&self) -> CommonLabels {
        read(&self.inner.labels).clone()
    }

    /// Built-in HTTP request metrics, registered on first use.
    pub fn http_metrics(&self) -> MetricsResult<&HttpMetrics> {
        self.inner.http.get_or_try_init(|| HttpMetrics::register(self))
    }

    // ── Route filtering ────────────────────────────────────────

    pub fn set_route_filter(&self, filter: RouteFilter) {
        *write(&self.inner.filter) = Arc::new(filter);
    }

    /// Enabled, matched to a known route, and not filtered out.
    pub fn should_observe(&self, path_template: &PathTemplate) -> bool {
        self.is_enabled()
            && path_template.is_handled
            && !read(&self.inner.filter).is_excluded(&path_template.value)
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Start (or restart) metrics collection.
    pub fn start(&self, options: StartOptions) -> MetricsResult<()> {
        let export_file = options.enabled && options.write_to_file;
        let file_path = match (&options.file_path, export_file) {
            (Some(path), true) => Some(path.clone()),
            (None, true) => {
                return Err(MetricsError::Configuration(
                    "write_to_file requires a file path".to_string(),
                ));
            }
            (_, false) => None,
        };
        if file_path.is_some() && options.interval.is_zero() {
            return Err(MetricsError::Configuration(
                "file export interval must be greater than zero".to_string(),
            ));
        }
        let runtime = match file_path {
            Some(_) => Some(Handle::try_current().map_err(|_| {
                MetricsError::Configuration(
                    "file export requires a running tokio runtime".to_string(),
                )
            })?),
            None => None,
        };

        {
            let mut labels = write(&self.inner.labels);
            if !options.service_name.is_empty() {
                labels.service = options.service_name.clone();
            }
            if !options.instance_id.is_empty() {
                labels.pod = options.instance_id.clone();
            }
        }

        let registry = {
            let mut live = write(&self.inner.live);
            let registry = live.registry.get_or_insert_with(Registry::new).clone();
            for handle in read(&self.inner.store).handles() {
                join_registry(&registry, handle);
            }
            live.active = true;
            registry
        };

        self.inner.enabled.store(options.enabled, Ordering::Release);

        if let (Some(path), Some(runtime)) = (file_path, runtime) {
            let exporter = FileExporter::spawn(&runtime, registry, path, options.interval);
            if let Some(old) = lock(&self.inner.exporter).replace(exporter) {
                old.stop();
            }
        }

        let labels = self.common_labels();
        info!(
            service = %labels.service,
            pod = %labels.pod,
            enabled = options.enabled,
            write_to_file = export_file,
            "metrics started"
        );
        if !options.enabled {
            info!("metrics disabled, recording is bypassed");
        }
        Ok(())
    }

    /// Stop collection: disable, unregister and clear every metric, and
    /// cancel the file exporter. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        self.inner.enabled.store(false, Ordering::Release);

        {
            let mut live = write(&self.inner.live);
            let store = read(&self.inner.store);
            for handle in store.handles() {
                if let Some(registry) = live.registry.as_ref() {
                    if let Err(e) = registry.unregister(handle.boxed()) {
                        debug!(metric = handle.name(), error = %e, "metric was not registered");
                    }
                }
                handle.reset();
            }
            live.active = false;
        }

        if let Some(exporter) = lock(&self.inner.exporter).take() {
            exporter.stop();
        }

        debug!("metrics stopped");
    }

    /// Whether a file exporter task is currently running.
    pub fn is_exporting_to_file(&self) -> bool {
        lock(&self.inner.exporter)
            .as_ref()
            .is_some_and(|e| !e.is_finished())
    }

    // ── Export ─────────────────────────────────────────────────

    /// Current registry contents in the text exposition format.
    ///
    /// Fails with `NotStarted` if `start` was never called.
    pub fn export(&self) -> MetricsResult<(Vec<u8>, &'static str)> {
        let registry = self.registry().ok_or(MetricsError::NotStarted)?;
        Ok((exposition::encode(&registry)?, CONTENT_TYPE_LATEST))
    }

    /// The live registry, once started.
    pub fn registry(&self) -> Option<Registry> {
        read(&self.inner.live).registry.clone()
    }

    /// Gather all live metric families (empty before `start`).
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry().map(|r| r.gather()).unwrap_or_default()
    }

    /// Read one sample from the live registry.
    ///
    /// See [`registry::sample_value`] for the accepted name suffixes.
    pub fn sample_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        registry::sample_value(&self.gather(), name, labels)
    }
}

fn join_registry(registry: &Registry, handle: &MetricHandle) {
    match registry.register(handle.boxed()) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
        Err(e) => warn!(metric = handle.name(), error = %e, "failed to add metric to registry"),
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(ctx: &MetricsContext) {
        ctx.start(StartOptions::new("svc", "pod-1")).unwrap();
    }

    #[test]
    fn new_context_is_disabled() {
        let ctx = MetricsContext::new();
        assert!(!ctx.is_enabled());
        assert!(matches!(ctx.export(), Err(MetricsError::NotStarted)));
    }

    #[test]
    fn start_sets_common_labels() {
        let ctx = MetricsContext::new();
        started(&ctx);
        assert_eq!(
            ctx.common_labels(),
            CommonLabels {
                service: "svc".into(),
                pod: "pod-1".into()
            }
        );
    }

    #[test]
    fn empty_identity_keeps_defaults() {
        let ctx = MetricsContext::new();
        let before = ctx.common_labels();
        ctx.start(StartOptions::default()).unwrap();
        let after = ctx.common_labels();
        assert_eq!(after.service, DEFAULT_SERVICE_NAME);
        assert_eq!(after.pod, before.pod);
        assert!(!after.pod.is_empty());
    }

    #[test]
    fn write_to_file_without_path_is_configuration_error() {
        let ctx = MetricsContext::new();
        let opts = StartOptions {
            write_to_file: true,
            ..StartOptions::new("svc", "pod")
        };
        assert!(matches!(ctx.start(opts), Err(MetricsError::Configuration(_))));
        assert!(!ctx.is_enabled());
    }

    #[test]
    fn write_to_file_ignored_when_disabled() {
        let ctx = MetricsContext::new();
        let opts = StartOptions {
            write_to_file: true,
            enabled: false,
            ..StartOptions::new("svc", "pod")
        };
        ctx.start(opts).unwrap();
        assert!(!ctx.is_exporting_to_file());
    }

    #[test]
    fn write_to_file_outside_runtime_is_configuration_error() {
        let ctx = MetricsContext::new();
        let opts = StartOptions::new("svc", "pod").write_to_file("/tmp/never-written.prom");
        assert!(matches!(ctx.start(opts), Err(MetricsError::Configuration(_))));
    }

    #[test]
    fn apply_labels_validates_label_set() {
        let ctx = MetricsContext::new();
        let handle = ctx
            .register(MetricKind::Counter, "jobs_total", "Jobs.", &["queue", "status"])
            .unwrap();
        started(&ctx);

        assert!(ctx
            .apply_labels(&handle, &[("status", "ok"), ("queue", "default")])
            .is_ok());

        for bad in [
            &[("queue", "default")][..],
            &[("queue", "default"), ("state", "ok")][..],
            &[("queue", "default"), ("status", "ok"), ("extra", "x")][..],
        ] {
            let err = ctx.apply_labels(&handle, bad).err().unwrap();
            assert!(matches!(err, MetricsError::LabelMismatch { .. }), "{bad:?}");
        }
    }

    #[test]
    fn apply_labels_is_noop_when_disabled() {
        let ctx = MetricsContext::new();
        let handle = ctx
            .register(MetricKind::Counter, "jobs_total", "Jobs.", &["queue"])
            .unwrap();
        // Wrong labels are not even checked while disabled.
        let bound = ctx.apply_labels(&handle, &[("nope", "x")]).unwrap();
        assert!(bound.is_noop());
    }

    #[test]
    fn apply_labels_rejects_foreign_handle() {
        let ctx = MetricsContext::new();
        let other = MetricsContext::new();
        let handle = other
            .register(MetricKind::Counter, "jobs_total", "Jobs.", &[])
            .unwrap();
        started(&ctx);
        assert!(matches!(
            ctx.apply_labels(&handle, &[]),
            Err(MetricsError::UnknownMetric(_))
        ));
    }

    #[test]
    fn recorded_values_carry_common_labels() {
        let ctx = MetricsContext::new();
        let handle = ctx
            .register(MetricKind::Counter, "jobs_total", "Jobs.", &["queue"])
            .unwrap();
        started(&ctx);

        ctx.apply_labels(&handle, &[("queue", "default")]).unwrap().inc();
        ctx.apply_labels(&handle, &[("queue", "default")]).unwrap().inc();

        assert_eq!(
            ctx.sample_value(
                "jobs_total",
                &[("service", "svc"), ("pod", "pod-1"), ("queue", "default")]
            ),
            Some(2.0)
        );
    }

    #[test]
    fn metrics_registered_after_start_are_exported() {
        let ctx = MetricsContext::new();
        started(&ctx);
        let handle = ctx
            .register(MetricKind::Gauge, "late_gauge", "Late.", &[])
            .unwrap();
        ctx.apply_labels(&handle, &[]).unwrap().set(7.0);

        let (body, content_type) = ctx.export().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(content_type, CONTENT_TYPE_LATEST);
        assert!(text.contains("late_gauge{pod=\"pod-1\",service=\"svc\"} 7"));
    }

    #[test]
    fn stop_is_idempotent_and_clears_values() {
        let ctx = MetricsContext::new();
        let handle = ctx
            .register(MetricKind::Counter, "jobs_total", "Jobs.", &[])
            .unwrap();
        ctx.stop();

        started(&ctx);
        ctx.apply_labels(&handle, &[]).unwrap().inc();
        ctx.stop();
        ctx.stop();
        assert!(!ctx.is_enabled());
        assert!(ctx.gather().is_empty());

        // Restarting re-registers the same metrics with fresh values.
        started(&ctx);
        let labels = [("service", "svc"), ("pod", "pod-1")];
        assert_eq!(ctx.sample_value("jobs_total", &labels), None);
        ctx.apply_labels(&handle, &[]).unwrap().inc();
        assert_eq!(ctx.sample_value("jobs_total", &labels), Some(1.0));
    }

    #[test]
    fn restart_without_stop_is_idempotent() {
        let ctx = MetricsContext::new();
        let handle = ctx
            .register(MetricKind::Counter, "jobs_total", "Jobs.", &[])
            .unwrap();
        started(&ctx);
        ctx.apply_labels(&handle, &[]).unwrap().inc();
        started(&ctx);
        assert_eq!(
            ctx.sample_value("jobs_total", &[("service", "svc"), ("pod", "pod-1")]),
            Some(1.0)
        );
    }

    #[test]
    fn should_observe_requires_enabled_handled_and_allowed() {
        let ctx = MetricsContext::new();
        let ok = PathTemplate::handled("/ok");
        assert!(!ctx.should_observe(&ok));

        started(&ctx);
        assert!(ctx.should_observe(&ok));
        assert!(!ctx.should_observe(&PathTemplate::unhandled("/ok")));

        ctx.set_route_filter(RouteFilter::new().exclude(["/ok"]));
        assert!(!ctx.should_observe(&ok));
        assert!(ctx.should_observe(&PathTemplate::handled("/other")));
    }

    #[tokio::test]
    async fn zero_export_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MetricsContext::new();
        let err = ctx
            .start(
                StartOptions::new("svc", "pod")
                    .write_to_file(dir.path().join("metrics.prom"))
                    .interval(Duration::ZERO),
            )
            .unwrap_err();
        assert!(matches!(err, MetricsError::Configuration(_)));
        assert!(!ctx.is_exporting_to_file());

        // Without file export the interval is unused.
        ctx.start(StartOptions::new("svc", "pod").interval(Duration::ZERO))
            .unwrap();
    }

    #[tokio::test]
    async fn start_spawns_and_stop_cancels_exporter() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MetricsContext::new();
        ctx.start(
            StartOptions::new("svc", "pod")
                .write_to_file(dir.path().join("metrics.prom"))
                .interval(Duration::from_secs(3600)),
        )
        .unwrap();
        assert!(ctx.is_exporting_to_file());

        ctx.stop();
        assert!(!ctx.is_exporting_to_file());
        ctx.stop();
    }
}
