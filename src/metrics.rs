use std::sync::LazyLock;

use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/* ============================= PROCESSING ============================= */

pub static PROCESSING_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "signalprocessing_processing_total",
            "Phase handler outcomes by phase and result",
        ),
        &["phase", "result"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static PROCESSING_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "signalprocessing_processing_duration_seconds",
            "Duration of each phase handler in seconds",
        ),
        &["phase"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/* ============================= ENRICHMENT ============================= */

pub static ENRICHMENT_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "signalprocessing_enrichment_errors_total",
            "Enrichment probe failures by error type",
        ),
        &["error_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DETECTED_LABELS_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "signalprocessing_detected_labels_count",
        "Detected labels produced by the most recent detection pass",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/* ============================= POLICY ============================= */

pub static POLICY_RELOAD_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_policy_reload_total",
        "Policy bundle reloads observed",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static POLICY_RELOAD_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_policy_reload_errors_total",
        "Policy bundle reloads rejected due to compile errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static REGO_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "signalprocessing_rego_duration_seconds",
        "Duration of individual Rego policy evaluations in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

pub static REGO_SECURITY_BLOCKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "signalprocessing_rego_security_blocks_total",
            "Reserved label keys stripped from custom-label policy output",
        ),
        &["blocked_label"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= AUDIT ============================= */

pub static AUDIT_EVENTS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_audit_events_dropped_total",
        "Audit events dropped because the emitter buffer was full",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static AUDIT_DISPATCH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_audit_dispatch_failures_total",
        "Audit events abandoned after exhausting sink retries",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= HELPERS ============================= */

/// Force-init every metric so all series appear on the first scrape.
pub fn force_init() {
    LazyLock::force(&PROCESSING_TOTAL);
    LazyLock::force(&PROCESSING_DURATION);
    LazyLock::force(&ENRICHMENT_ERRORS);
    LazyLock::force(&DETECTED_LABELS_COUNT);
    LazyLock::force(&POLICY_RELOAD_TOTAL);
    LazyLock::force(&POLICY_RELOAD_ERRORS);
    LazyLock::force(&REGO_DURATION);
    LazyLock::force(&REGO_SECURITY_BLOCKS);
    LazyLock::force(&AUDIT_EVENTS_DROPPED);
    LazyLock::force(&AUDIT_DISPATCH_FAILURES);
}

/// Encode the registry in Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics not valid utf-8: {e}")))
}

/* ============================= TESTS ============================= */
