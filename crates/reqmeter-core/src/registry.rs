//! Metric registry — definitions, label schemas, and label-bound views.
//!
//! Registration is decoupled from activation: a [`MetricHandle`] can be
//! declared before the facility is started, and joins the live
//! `prometheus::Registry` only once [`MetricsContext::start`] runs.
//!
//! [`MetricsContext::start`]: crate::MetricsContext::start

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::core::Collector;
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
};

use crate::context::COMMON_LABELS;
use crate::error::{MetricsError, MetricsResult};

/// Kind of a registered metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonically increasing value.
    Counter,
    /// Value that can go up and down.
    Gauge,
    /// Bucketed distribution of observations.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Gauge => write!(f, "gauge"),
            Self::Histogram => write!(f, "histogram"),
        }
    }
}

/// Identity of a registration, unique across all contexts in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MetricId(u64);

static NEXT_METRIC_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
enum VecCollector {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

/// A registered metric.
///
/// Cheap to clone; all clones refer to the same underlying collector.
#[derive(Clone)]
pub struct MetricHandle {
    id: MetricId,
    name: Arc<str>,
    kind: MetricKind,
    collector: VecCollector,
}

impl fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MetricHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub(crate) fn id(&self) -> MetricId {
        self.id
    }

    /// Boxed collector for `prometheus::Registry::{register, unregister}`.
    pub(crate) fn boxed(&self) -> Box<dyn Collector> {
        match &self.collector {
            VecCollector::Counter(c) => Box::new(c.clone()),
            VecCollector::Gauge(g) => Box::new(g.clone()),
            VecCollector::Histogram(h) => Box::new(h.clone()),
        }
    }

    /// Drop every labelled child, returning all values to zero.
    pub(crate) fn reset(&self) {
        match &self.collector {
            VecCollector::Counter(c) => c.reset(),
            VecCollector::Gauge(g) => g.reset(),
            VecCollector::Histogram(h) => h.reset(),
        }
    }

    /// Resolve the child for a full, ordered label value list
    /// (common labels first).
    pub(crate) fn bind(&self, values: &[&str]) -> MetricsResult<BoundMetric> {
        let bound = match &self.collector {
            VecCollector::Counter(c) => Bound::Counter(
                c.get_metric_with_label_values(values)
                    .map_err(MetricsError::InvalidMetric)?,
            ),
            VecCollector::Gauge(g) => Bound::Gauge(
                g.get_metric_with_label_values(values)
                    .map_err(MetricsError::InvalidMetric)?,
            ),
            VecCollector::Histogram(h) => Bound::Histogram(
                h.get_metric_with_label_values(values)
                    .map_err(MetricsError::InvalidMetric)?,
            ),
        };
        Ok(BoundMetric(bound))
    }
}

enum Bound {
    Noop,
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

/// A metric bound to a concrete set of label values.
///
/// Operations that do not apply to the metric kind (e.g. `dec` on a
/// counter) do nothing. A no-op view is returned while metrics are
/// disabled.
pub struct BoundMetric(Bound);

impl BoundMetric {
    /// A view that ignores every operation.
    pub fn noop() -> Self {
        Self(Bound::Noop)
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.0, Bound::Noop)
    }

    pub fn inc(&self) {
        self.inc_by(1.0);
    }

    pub fn inc_by(&self, v: f64) {
        match &self.0 {
            Bound::Counter(c) => c.inc_by(v),
            Bound::Gauge(g) => g.add(v),
            Bound::Noop | Bound::Histogram(_) => {}
        }
    }

    pub fn dec(&self) {
        if let Bound::Gauge(g) = &self.0 {
            g.dec();
        }
    }

    pub fn set(&self, v: f64) {
        if let Bound::Gauge(g) = &self.0 {
            g.set(v);
        }
    }

    pub fn observe(&self, v: f64) {
        if let Bound::Histogram(h) = &self.0 {
            h.observe(v);
        }
    }
}

/// Name → handle and id → (name, declared labels) storage.
#[derive(Default)]
pub(crate) struct MetricStore {
    by_name: HashMap<String, MetricHandle>,
    by_id: HashMap<MetricId, (String, Vec<String>)>,
}

impl MetricStore {
    pub(crate) fn register(
        &mut self,
        kind: MetricKind,
        name: &str,
        description: &str,
        labels: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> MetricsResult<MetricHandle> {
        if self.by_name.contains_key(name) {
            return Err(MetricsError::DuplicateName(name.to_string()));
        }
        if let Some(reserved) = labels.iter().find(|l| COMMON_LABELS.contains(*l)) {
            return Err(MetricsError::InvalidMetric(prometheus::Error::Msg(format!(
                "label {reserved:?} is reserved for common labels"
            ))));
        }

        let mut full_labels: Vec<&str> = COMMON_LABELS.to_vec();
        full_labels.extend_from_slice(labels);

        let collector = match kind {
            MetricKind::Counter => VecCollector::Counter(
                CounterVec::new(Opts::new(name, description), &full_labels)
                    .map_err(MetricsError::InvalidMetric)?,
            ),
            MetricKind::Gauge => VecCollector::Gauge(
                GaugeVec::new(Opts::new(name, description), &full_labels)
                    .map_err(MetricsError::InvalidMetric)?,
            ),
            MetricKind::Histogram => {
                let mut opts = HistogramOpts::new(name, description);
                if let Some(buckets) = buckets {
                    opts = opts.buckets(buckets);
                }
                VecCollector::Histogram(
                    HistogramVec::new(opts, &full_labels).map_err(MetricsError::InvalidMetric)?,
                )
            }
        };

        let id = MetricId(NEXT_METRIC_ID.fetch_add(1, Ordering::Relaxed));

        let handle = MetricHandle {
            id,
            name: Arc::from(name),
            kind,
            collector,
        };
        self.by_name.insert(name.to_string(), handle.clone());
        self.by_id.insert(
            id,
            (
                name.to_string(),
                labels.iter().map(|l| l.to_string()).collect(),
            ),
        );
        Ok(handle)
    }

    /// Declared (non-common) labels for a handle, if it belongs to this store.
    pub(crate) fn declared_labels(&self, id: MetricId) -> Option<&[String]> {
        self.by_id.get(&id).map(|(_, labels)| labels.as_slice())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&MetricHandle> {
        self.by_name.get(name)
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = &MetricHandle> {
        self.by_name.values()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_name.len()
    }
}

/// Look up a single sample in gathered metric families.
///
/// `name` may carry the histogram suffixes `_bucket` (requires an `le`
/// label), `_sum` and `_count`. Labels must match the series exactly.
/// Returns `None` when no such series exists.
pub fn sample_value(families: &[MetricFamily], name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    for family in families {
        let family_name = family.get_name();
        let suffix = match name.strip_prefix(family_name) {
            Some(suffix) => suffix,
            None => continue,
        };

        match (family.get_field_type(), suffix) {
            (MetricType::COUNTER, "") => {
                return find_series(family, labels).map(|m| m.get_counter().get_value());
            }
            (MetricType::GAUGE, "") => {
                return find_series(family, labels).map(|m| m.get_gauge().get_value());
            }
            (MetricType::HISTOGRAM, "_count") => {
                return find_series(family, labels)
                    .map(|m| m.get_histogram().get_sample_count() as f64);
            }
            (MetricType::HISTOGRAM, "_sum") => {
                return find_series(family, labels).map(|m| m.get_histogram().get_sample_sum());
            }
            (MetricType::HISTOGRAM, "_bucket") => {
                let le = labels.iter().find(|(k, _)| *k == "le").map(|(_, v)| *v)?;
                let rest: Vec<(&str, &str)> =
                    labels.iter().filter(|(k, _)| *k != "le").copied().collect();
                let histogram = find_series(family, &rest)?.get_histogram();
                if le == "+Inf" {
                    return Some(histogram.get_sample_count() as f64);
                }
                let bound: f64 = le.parse().ok()?;
                return histogram
                    .get_bucket()
                    .iter()
                    .find(|b| b.get_upper_bound() == bound)
                    .map(|b| b.get_cumulative_count() as f64);
            }
            _ => continue,
        }
    }
    None
}

fn find_series<'a>(
    family: &'a MetricFamily,
    labels: &[(&str, &str)],
) -> Option<&'a prometheus::proto::Metric> {
    family.get_metric().iter().find(|m| {
        let pairs = m.get_label();
        pairs.len() == labels.len()
            && labels.iter().all(|(k, v)| {
                pairs
                    .iter()
                    .any(|p| p.get_name() == *k && p.get_value() == *v)
            })
    })
}
