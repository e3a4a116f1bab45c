//! Prometheus metrics for the session and pool layers.
//!
//! The registry is process-global; embedding applications can export it
//! through whatever scrape endpoint they already run.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Client metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Session metrics
    /// Sessions successfully connected
    pub sessions_connected_total: IntCounter,
    /// Sessions closed, by reason (failed, expired, idle, cleared, returned)
    pub sessions_closed_total: IntCounterVec,
    /// Currently live sessions (leased + idle) across all pools
    pub sessions_live: IntGauge,

    // Pool metrics
    /// Acquire calls served, by source (idle, fresh)
    pub pool_acquires_total: IntCounterVec,
    /// Acquire calls that timed out waiting for a slot
    pub pool_acquire_timeouts_total: IntCounter,
    /// Time spent waiting in acquire (seconds)
    pub pool_acquire_wait_seconds: Histogram,
    /// Idle sessions across all pools
    pub pool_idle: IntGauge,

    // Cancellation metrics
    /// Side-channel kill attempts, by outcome (ok, failed)
    pub cancellations_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let sessions_connected_total = IntCounter::with_opts(Opts::new(
            "hermod_sessions_connected_total",
            "Sessions successfully connected",
        ))
        .unwrap();

        let sessions_closed_total = IntCounterVec::new(
            Opts::new("hermod_sessions_closed_total", "Sessions closed by reason"),
            &["reason"],
        )
        .unwrap();

        let sessions_live = IntGauge::with_opts(Opts::new(
            "hermod_sessions_live",
            "Currently live sessions (leased + idle)",
        ))
        .unwrap();

        let pool_acquires_total = IntCounterVec::new(
            Opts::new("hermod_pool_acquires_total", "Acquire calls served by source"),
            &["source"],
        )
        .unwrap();

        let pool_acquire_timeouts_total = IntCounter::with_opts(Opts::new(
            "hermod_pool_acquire_timeouts_total",
            "Acquire calls that timed out waiting for a slot",
        ))
        .unwrap();

        let pool_acquire_wait_seconds = Histogram::with_opts(HistogramOpts::new(
            "hermod_pool_acquire_wait_seconds",
            "Time spent waiting in acquire",
        ))
        .unwrap();

        let pool_idle = IntGauge::with_opts(Opts::new(
            "hermod_pool_idle",
            "Idle sessions across all pools",
        ))
        .unwrap();

        let cancellations_total = IntCounterVec::new(
            Opts::new(
                "hermod_cancellations_total",
                "Side-channel kill attempts by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        registry
            .register(Box::new(sessions_connected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_closed_total.clone()))
            .unwrap();
        registry.register(Box::new(sessions_live.clone())).unwrap();
        registry
            .register(Box::new(pool_acquires_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_acquire_timeouts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_acquire_wait_seconds.clone()))
            .unwrap();
        registry.register(Box::new(pool_idle.clone())).unwrap();
        registry
            .register(Box::new(cancellations_total.clone()))
            .unwrap();

        Self {
            registry,
            sessions_connected_total,
            sessions_closed_total,
            sessions_live,
            pool_acquires_total,
            pool_acquire_timeouts_total,
            pool_acquire_wait_seconds,
            pool_idle,
            cancellations_total,
        }
    }
}
