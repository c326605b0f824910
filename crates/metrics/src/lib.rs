//! Metrics and tracing setup for kvproxy.
//!
//! Provides a global [`ProxyMetrics`] singleton backed by the `prometheus`
//! crate. Exposition over HTTP is left to the embedding service, which can
//! serve [`encode_metrics`] output.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<ProxyMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static ProxyMetrics {
    METRICS.get_or_init(ProxyMetrics::new)
}

/// All Prometheus metrics for the request processors.
pub struct ProxyMetrics {
    pub registry: Registry,

    // ── Client side ──
    pub client_replies: IntCounterVec,
    pub request_latency_secs: HistogramVec,
    pub active_processors: IntGaugeVec,
    pub pool_rejections: IntCounterVec,

    // ── Storage side ──
    pub ss_requests_sent: IntCounterVec,
    pub ss_send_failures: IntCounterVec,
    pub ss_timeouts: IntCounterVec,
    pub ss_io_errors: IntCounterVec,

    // ── Reconciliation ──
    pub repairs_sent: IntCounterVec,
    pub mark_deletes_sent: IntCounterVec,
    pub replications: IntCounter,
    pub version_overflows: IntCounter,

    // ── Faults ──
    pub invariant_violations: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for request latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("counter vec opts");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter vec");
    c
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("counter opts");
    registry.register(Box::new(c.clone())).expect("register counter");
    c
}

impl ProxyMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let client_replies = counter_vec(
            &registry,
            "kvproxy_client_replies_total",
            "Replies sent to clients, by operation and status",
            &["op", "status"],
        );
        let request_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "kvproxy_request_latency_seconds",
                "Time from request arrival to client reply",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )
        .expect("request_latency_secs histogram");
        registry
            .register(Box::new(request_latency_secs.clone()))
            .expect("register request_latency_secs");

        let active_processors = IntGaugeVec::new(
            Opts::new(
                "kvproxy_active_processors",
                "Request processors currently checked out, by operation",
            ),
            &["op"],
        )
        .expect("active_processors gauge vec");
        registry
            .register(Box::new(active_processors.clone()))
            .expect("register active_processors");

        let pool_rejections = counter_vec(
            &registry,
            "kvproxy_pool_rejections_total",
            "Requests rejected because the processor limit was reached",
            &["op"],
        );
        let ss_requests_sent = counter_vec(
            &registry,
            "kvproxy_ss_requests_sent_total",
            "Requests sent to storage servers, by storage op",
            &["op"],
        );
        let ss_send_failures = counter_vec(
            &registry,
            "kvproxy_ss_send_failures_total",
            "Requests that could not be handed to a storage connection",
            &["reason"],
        );
        let ss_timeouts = counter_vec(
            &registry,
            "kvproxy_ss_timeouts_total",
            "Storage server requests that timed out, by storage op",
            &["op"],
        );
        let ss_io_errors = counter_vec(
            &registry,
            "kvproxy_ss_io_errors_total",
            "Storage server requests that failed in transport, by storage op",
            &["op"],
        );
        let repairs_sent = counter_vec(
            &registry,
            "kvproxy_repairs_sent_total",
            "Repair requests sent, by client operation",
            &["op"],
        );
        let mark_deletes_sent = counter_vec(
            &registry,
            "kvproxy_mark_deletes_sent_total",
            "MarkDelete requests sent, by client operation",
            &["op"],
        );
        let replications = counter(
            &registry,
            "kvproxy_replications_total",
            "Requests handed to the cross-datacenter replicator",
        );
        let version_overflows = counter(
            &registry,
            "kvproxy_version_overflows_total",
            "Commits whose record version exceeded the configured maximum",
        );
        let invariant_violations = counter(
            &registry,
            "kvproxy_invariant_violations_total",
            "Storage responses that broke processor bookkeeping",
        );

        Self {
            registry,
            client_replies,
            request_latency_secs,
            active_processors,
            pool_rejections,
            ss_requests_sent,
            ss_send_failures,
            ss_timeouts,
            ss_io_errors,
            repairs_sent,
            mark_deletes_sent,
            replications,
            version_overflows,
            invariant_violations,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: record the latency of a finished client request.
pub fn observe_request_latency(op: &str, elapsed: std::time::Duration) {
    metrics()
        .request_latency_secs
        .with_label_values(&[op])
        .observe(elapsed.as_secs_f64());
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.replications.get();
        m.replications.inc();
        m.replications.inc();
        assert_eq!(m.replications.get(), before + 2);

        m.client_replies.with_label_values(&["Get", "Ok"]).inc();
        m.ss_requests_sent.with_label_values(&["Read"]).inc();
        m.ss_timeouts.with_label_values(&["Commit"]).inc();
    }

    #[test]
    fn test_active_gauge_moves_both_ways() {
        let g = metrics().active_processors.with_label_values(&["gauge_test"]);
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.dec();
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().version_overflows.inc();
        metrics()
            .repairs_sent
            .with_label_values(&["encode_test"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("kvproxy_version_overflows_total"));
        assert!(output.contains("kvproxy_repairs_sent_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_histogram_records() {
        observe_request_latency("histogram_test", std::time::Duration::from_millis(5));
        observe_request_latency("histogram_test", std::time::Duration::from_millis(10));

        let h: Histogram = metrics()
            .request_latency_secs
            .with_label_values(&["histogram_test"]);
        assert_eq!(h.get_sample_count(), 2);
        assert!((h.get_sample_sum() - 0.015).abs() < 1e-9);
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
