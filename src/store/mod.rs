//! Label-keyed gauge store backing the `/metrics` endpoint.
//!
//! The store wraps a set of Prometheus [`GaugeVec`]s behind a single
//! read-write lock. Every mutation goes through a [`StoreWriter`], which
//! holds the write side for its whole lifetime, so a reconciliation step
//! that removes one series and inserts its replacement is never observed
//! half-applied by a concurrent scrape.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors returned by [`GaugeStore`] operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown metric id {0}")]
    UnknownMetric(usize),

    #[error("metric {metric} expects {expected} label values, got {got}")]
    LabelArity {
        metric: String,
        expected: usize,
        got: usize,
    },

    #[error("metrics backend: {0}")]
    Backend(#[from] prometheus::Error),

    #[error("rendered metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Handle to a gauge registered in a [`GaugeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(usize);

/// One active series as seen by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Label values in declaration order.
    pub labels: Vec<String>,
    pub value: f64,
}

struct RegisteredGauge {
    name: String,
    label_names: Vec<String>,
    vec: GaugeVec,
}

impl RegisteredGauge {
    fn check_arity(&self, labels: &[&str]) -> Result<(), StoreError> {
        if labels.len() != self.label_names.len() {
            return Err(StoreError::LabelArity {
                metric: self.name.clone(),
                expected: self.label_names.len(),
                got: labels.len(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    gauges: Vec<RegisteredGauge>,
    collectors: Vec<Box<dyn Collector>>,
}

/// In-memory registry of named, labeled gauges.
pub struct GaugeStore {
    namespace: String,
    registry: Registry,
    inner: RwLock<Inner>,
    generation: AtomicU64,
}

impl std::fmt::Debug for GaugeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeStore")
            .field("namespace", &self.namespace)
            .field("generation", &self.generation())
            .finish()
    }
}

impl Default for GaugeStore {
    fn default() -> Self {
        Self::new("")
    }
}

impl GaugeStore {
    /// Creates an empty store. A non-empty `namespace` is prepended to every
    /// metric name as `<namespace>_<name>`.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            registry: Registry::new(),
            inner: RwLock::new(Inner::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Registers a gauge with a fixed set of label names.
    ///
    /// Rendering follows registration order.
    pub fn register(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<MetricId, StoreError> {
        let mut opts = Opts::new(name, help);
        if !self.namespace.is_empty() {
            opts = opts.namespace(self.namespace.clone());
        }
        let fq_name = opts.fq_name();

        let vec = GaugeVec::new(opts, label_names)?;
        // The registry rejects duplicate names and inconsistent label sets.
        self.registry.register(Box::new(vec.clone()))?;

        let mut inner = self.inner.write();
        inner.gauges.push(RegisteredGauge {
            name: fq_name,
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            vec,
        });

        Ok(MetricId(inner.gauges.len() - 1))
    }

    /// Appends an arbitrary collector, rendered after all registered gauges.
    pub fn register_collector(&self, collector: Box<dyn Collector>) {
        self.inner.write().collectors.push(collector);
    }

    /// Appends the process collector (CPU, memory, open fds) when the
    /// platform supports it.
    pub fn register_process_metrics(&self) {
        #[cfg(target_os = "linux")]
        self.register_collector(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ));

        #[cfg(not(target_os = "linux"))]
        tracing::warn!("process metrics are only available on Linux");
    }

    /// Takes the write side of the store for a batch of mutations.
    pub fn write(&self) -> StoreWriter<'_> {
        StoreWriter {
            inner: self.inner.write(),
            generation: &self.generation,
        }
    }

    /// Creates or overwrites the series matching `labels`.
    pub fn set_labeled(&self, id: MetricId, labels: &[&str], value: f64) -> Result<(), StoreError> {
        self.write().set_labeled(id, labels, value)
    }

    /// Deletes the series matching `labels`. Returns whether one existed.
    pub fn remove_labeled(&self, id: MetricId, labels: &[&str]) -> Result<bool, StoreError> {
        self.write().remove_labeled(id, labels)
    }

    /// Deletes every series of a metric.
    pub fn reset_metric(&self, id: MetricId) -> Result<(), StoreError> {
        self.write().reset_metric(id)
    }

    /// Number of mutations applied since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Active series of a metric, sorted by label values.
    pub fn series(&self, id: MetricId) -> Result<Vec<Series>, StoreError> {
        let inner = self.inner.read();
        let gauge = inner.gauges.get(id.0).ok_or(StoreError::UnknownMetric(id.0))?;

        let mut out = Vec::new();
        for family in gauge.vec.collect() {
            for metric in family.get_metric() {
                let labels = gauge
                    .label_names
                    .iter()
                    .map(|name| {
                        metric
                            .get_label()
                            .iter()
                            .find(|pair| pair.get_name() == name)
                            .map(|pair| pair.get_value().to_string())
                            .unwrap_or_default()
                    })
                    .collect();
                out.push(Series {
                    labels,
                    value: metric.get_gauge().get_value(),
                });
            }
        }

        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(out)
    }

    /// Active series of a metric whose first label equals `first`.
    ///
    /// Every per-node metric declares the node name as its first label, so
    /// this selects one node's series.
    pub fn series_for(&self, id: MetricId, first: &str) -> Result<Vec<Series>, StoreError> {
        Ok(self
            .series(id)?
            .into_iter()
            .filter(|s| s.labels.first().map(String::as_str) == Some(first))
            .collect())
    }

    /// Value of one series, if it exists.
    pub fn value(&self, id: MetricId, labels: &[&str]) -> Result<Option<f64>, StoreError> {
        Ok(self
            .series(id)?
            .into_iter()
            .find(|s| s.labels.iter().map(String::as_str).eq(labels.iter().copied()))
            .map(|s| s.value))
    }

    /// Renders the Prometheus text exposition of every registered metric.
    pub fn render_snapshot(&self) -> Result<String, StoreError> {
        let families = {
            let inner = self.inner.read();
            let mut families: Vec<MetricFamily> = Vec::new();
            for gauge in &inner.gauges {
                families.extend(gauge.vec.collect());
            }
            for collector in &inner.collectors {
                families.extend(collector.collect());
            }
            families
        };

        // The text encoder rejects families without samples.
        let families: Vec<MetricFamily> = families
            .into_iter()
            .filter(|f| !f.get_metric().is_empty())
            .collect();

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Content type of [`GaugeStore::render_snapshot`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

/// Exclusive access to a [`GaugeStore`] for a batch of mutations.
///
/// Scrapes block until the writer is dropped.
pub struct StoreWriter<'a> {
    inner: RwLockWriteGuard<'a, Inner>,
    generation: &'a AtomicU64,
}

impl StoreWriter<'_> {
    fn gauge(&self, id: MetricId) -> Result<&RegisteredGauge, StoreError> {
        self.inner
            .gauges
            .get(id.0)
            .ok_or(StoreError::UnknownMetric(id.0))
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Creates or overwrites the series matching `labels`.
    pub fn set_labeled(&mut self, id: MetricId, labels: &[&str], value: f64) -> Result<(), StoreError> {
        let gauge = self.gauge(id)?;
        gauge.check_arity(labels)?;
        gauge.vec.get_metric_with_label_values(labels)?.set(value);
        self.bump();
        Ok(())
    }

    /// Deletes the series matching `labels`; absent series are a no-op.
    pub fn remove_labeled(&mut self, id: MetricId, labels: &[&str]) -> Result<bool, StoreError> {
        let gauge = self.gauge(id)?;
        gauge.check_arity(labels)?;
        // Arity is checked above, so an error here only means "not present".
        if gauge.vec.remove_label_values(labels).is_err() {
            return Ok(false);
        }
        self.bump();
        Ok(true)
    }

    /// Deletes every series of a metric.
    pub fn reset_metric(&mut self, id: MetricId) -> Result<(), StoreError> {
        self.gauge(id)?.vec.reset();
        self.bump();
        Ok(())
    }
}
