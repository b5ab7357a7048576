use crate::error::Error;

use std::sync::Arc;

use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub lifecycle: LifecycleMetrics,
    pub ready: Gauge,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("stackop");
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        let lifecycle = LifecycleMetrics::default().register(&mut registry);
        let ready = Gauge::default();
        registry.register("ready", "controller readiness", ready.clone());
        Self {
            reconcile,
            lifecycle,
            ready,
            registry: Arc::new(registry),
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = ();

    fn try_from(id: &TraceId) -> Result<TraceLabel, ()> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(())
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<(), Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<(), Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciliation errors",
            self.failures.clone(),
        );
        r.register("reconcile_runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure<K: ResourceExt>(&self, obj: &Arc<K>, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.get_or_create(&()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Per-stack lifecycle event counters.
#[derive(Clone, Default)]
pub struct LifecycleMetrics {
    pub expirations: Counter,
    pub rollouts: Counter,
    pub backup_jobs: Counter,
}

impl LifecycleMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "stack_expirations",
            "stacks flipped inactive by the expiration rule",
            self.expirations.clone(),
        );
        r.register(
            "stack_rollouts",
            "pod-template rollouts triggered by deployedAt",
            self.rollouts.clone(),
        );
        r.register(
            "backup_jobs_dispatched",
            "backup and restore jobs created",
            self.backup_jobs.clone(),
        );
        self
    }
}

/// Observes the reconcile duration on drop so early returns are measured too.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
