//! Prometheus metrics for the reconcile loop

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one reconcile pass, used as metric label
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    /// Failed, but expected to clear up without intervention
    Transient,
    Error,
    /// The cluster was gone from the cache
    Tombstone,
}

impl ReconcileResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Transient => "transient",
            ReconcileResult::Error => "error",
            ReconcileResult::Tombstone => "tombstone",
        }
    }
}

/// Metrics collector shared by all reconcile workers
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconcile passes by result
    pub reconcile_total: IntCounterVec,
    /// Duration of reconcile passes
    pub reconcile_duration_seconds: Histogram,
    /// Keys waiting in the work queue
    pub queue_depth: IntGauge,
    /// Keys put back into the queue after a failure
    pub queue_retries_total: IntCounter,
    pub registry: Arc<Registry>,
}

impl ControllerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconcile_total = IntCounterVec::new(
            Opts::new("kubeception_reconcile_total", "Reconcile passes by result"),
            &["result"],
        )?;

        let reconcile_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "kubeception_reconcile_duration_seconds",
            "Duration of reconcile passes in seconds",
        ))?;

        let queue_depth = IntGauge::new("kubeception_queue_depth", "Keys waiting in the work queue")?;

        let queue_retries_total = IntCounter::new(
            "kubeception_queue_retries_total",
            "Keys requeued with backoff after a failed pass",
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_retries_total.clone()))?;

        Ok(Self {
            reconcile_total,
            reconcile_duration_seconds,
            queue_depth,
            queue_retries_total,
            registry,
        })
    }

    pub fn record(&self, result: ReconcileResult, duration: Duration) {
        self.reconcile_total
            .with_label_values(&[result.as_str()])
            .inc();
        self.reconcile_duration_seconds
            .observe(duration.as_secs_f64());
        if matches!(result, ReconcileResult::Transient | ReconcileResult::Error) {
            self.queue_retries_total.inc();
        }
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
