//! Prometheus metrics
//!
//! Collectors live in the default registry so the `/metrics` endpoint can
//! gather them with `prometheus::gather()`.

use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use std::sync::OnceLock;
use tracing::warn;

pub struct Metrics {
    pub reconcile_total: IntCounterVec,
    pub queue_depth: IntGaugeVec,
    pub pool_free_bytes: IntGaugeVec,
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

fn register<C>(collector: C, name: &str) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    if let Err(e) = prometheus::register(Box::new(collector.clone())) {
        warn!(metric = name, error = %e, "Metric not registered");
    }
    collector
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            reconcile_total: register(
                IntCounterVec::new(
                    Opts::new(
                        "local_storage_reconcile_total",
                        "Reconcile attempts by object kind and result",
                    ),
                    &["kind", "result"],
                )?,
                "local_storage_reconcile_total",
            ),
            queue_depth: register(
                IntGaugeVec::new(
                    Opts::new("local_storage_queue_depth", "Keys waiting in each task queue"),
                    &["kind"],
                )?,
                "local_storage_queue_depth",
            ),
            pool_free_bytes: register(
                IntGaugeVec::new(
                    Opts::new(
                        "local_storage_pool_free_bytes",
                        "Free capacity of each storage pool",
                    ),
                    &["pool"],
                )?,
                "local_storage_pool_free_bytes",
            ),
        })
    }
}

/// Process-wide collectors, registered on first use
pub fn metrics() -> Option<&'static Metrics> {
    METRICS
        .get_or_init(|| match Metrics::new() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "Metrics disabled");
                None
            }
        })
        .as_ref()
}

pub fn record_reconcile(kind: &str, ok: bool) {
    let result = if ok { "success" } else { "error" };
    if let Some(m) = metrics() {
        m.reconcile_total.with_label_values(&[kind, result]).inc();
    }
}

pub fn set_queue_depth(kind: &str, depth: usize) {
    if let Some(m) = metrics() {
        m.queue_depth.with_label_values(&[kind]).set(depth as i64);
    }
}

pub fn set_pool_free_bytes(pool: &str, bytes: i64) {
    if let Some(m) = metrics() {
        m.pool_free_bytes.with_label_values(&[pool]).set(bytes);
    }
}
