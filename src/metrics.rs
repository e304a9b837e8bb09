// Prometheus metrics definitions for the matchpoint backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Engine poll loops currently searching for an opponent.
    pub static ref ACTIVE_SEARCHES: IntGauge =
        IntGauge::new("matchpoint_active_searches", "Poll loops currently searching").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Tickets accepted into the queue.
    pub static ref TICKETS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "matchpoint_tickets_created_total",
        "Tickets accepted into the queue",
    )
    .unwrap();

    /// Tickets expired, by reason (timeout, store-error).
    pub static ref TICKETS_EXPIRED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("matchpoint_tickets_expired_total", "Tickets expired"),
        &["reason"],
    )
    .unwrap();

    /// Waiting tickets cancelled by the player or a dropped stream.
    pub static ref TICKETS_CANCELLED_TOTAL: IntCounter = IntCounter::new(
        "matchpoint_tickets_cancelled_total",
        "Waiting tickets cancelled",
    )
    .unwrap();

    /// Matches committed, by source (queue binding vs. direct start).
    pub static ref MATCHES_FORMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("matchpoint_matches_formed_total", "Matches committed"),
        &["source"],
    )
    .unwrap();

    /// Matches finished with a reported result.
    pub static ref MATCHES_FINISHED_TOTAL: IntCounter = IntCounter::new(
        "matchpoint_matches_finished_total",
        "Matches finished with a result",
    )
    .unwrap();

    /// Active matches cancelled.
    pub static ref MATCHES_CANCELLED_TOTAL: IntCounter = IntCounter::new(
        "matchpoint_matches_cancelled_total",
        "Active matches cancelled",
    )
    .unwrap();

    /// Binding attempts that lost the race to a concurrent worker.
    pub static ref BIND_CONFLICTS_TOTAL: IntCounter = IntCounter::new(
        "matchpoint_bind_conflicts_total",
        "Binding attempts that lost a race",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Queue wait in seconds for tickets that ended up matched.
    pub static ref MATCH_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("matchpoint_match_wait_seconds", "Queue wait for matched tickets")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 90.0]),
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_SEARCHES.clone()),
        Box::new(TICKETS_CREATED_TOTAL.clone()),
        Box::new(TICKETS_EXPIRED_TOTAL.clone()),
        Box::new(TICKETS_CANCELLED_TOTAL.clone()),
        Box::new(MATCHES_FORMED_TOTAL.clone()),
        Box::new(MATCHES_FINISHED_TOTAL.clone()),
        Box::new(MATCHES_CANCELLED_TOTAL.clone()),
        Box::new(BIND_CONFLICTS_TOTAL.clone()),
        Box::new(MATCH_WAIT_SECONDS.clone()),
    ];

    for c in collectors {
        REGISTRY.register(c).expect("failed to register metric");
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
