//! Prometheus metrics.
//!
//! All instruments live in an explicitly constructed [`Metrics`] struct with
//! its own [`Registry`], passed to the components that update them. Nothing
//! registers into a global registry, which keeps tests free of cross-test
//! interference.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::Result;

/// Namespace that prefixes all bridgestrap metrics.
pub const PROMETHEUS_NAMESPACE: &str = "bridgestrap";

/// The service's prometheus instruments.
pub struct Metrics {
    registry: Registry,
    /// The number of cached elements.
    pub cache_size: IntGauge,
    /// The number of pending requests.
    pub pending_reqs: IntGauge,
    /// The number of pending tor controller events.
    pub pending_events: IntGauge,
    /// The fraction of functional bridges currently in the cache.
    pub frac_functional: Gauge,
    /// The time it took to finish bridge tests.
    pub tor_test_time: Histogram,
    /// The number of tor events, by type and status.
    pub events: IntCounterVec,
    /// The number of cache hits and misses.
    pub cache: IntCounterVec,
    /// The type and status of requests.
    pub requests: IntCounterVec,
    /// The number of functional and dysfunctional bridges.
    pub bridge_status: IntCounterVec,
}

impl Metrics {
    /// Creates and registers all instruments.
    ///
    /// The histogram buckets grow exponentially from half a second up to the
    /// test timeout, with one final bucket just past it to catch tests that
    /// ran into the deadline.
    pub fn new(test_timeout_secs: f64) -> Result<Self> {
        let registry = Registry::new();

        let cache_size = IntGauge::with_opts(
            Opts::new("cache_size", "The number of cached elements")
                .namespace(PROMETHEUS_NAMESPACE),
        )?;
        let pending_reqs = IntGauge::with_opts(
            Opts::new("pending_requests", "The number of pending requests")
                .namespace(PROMETHEUS_NAMESPACE),
        )?;
        let pending_events = IntGauge::with_opts(
            Opts::new("pending_events", "The number of pending Tor controller events")
                .namespace(PROMETHEUS_NAMESPACE),
        )?;
        let frac_functional = Gauge::with_opts(
            Opts::new(
                "fraction_functional",
                "The fraction of functional bridges currently in the cache",
            )
            .namespace(PROMETHEUS_NAMESPACE),
        )?;

        let mut buckets = Vec::new();
        let mut bucket = 0.5;
        while bucket < test_timeout_secs {
            buckets.push(bucket);
            bucket *= 2.0;
        }
        buckets.push(test_timeout_secs + 1.0);
        let tor_test_time = Histogram::with_opts(
            HistogramOpts::new("tor_test_time", "The time it took to finish bridge tests")
                .namespace(PROMETHEUS_NAMESPACE)
                .buckets(buckets),
        )?;

        let events = IntCounterVec::new(
            Opts::new("tor_events_total", "The number of Tor events")
                .namespace(PROMETHEUS_NAMESPACE),
            &["type", "status"],
        )?;
        let cache = IntCounterVec::new(
            Opts::new("cache_total", "The number of cache hits and misses")
                .namespace(PROMETHEUS_NAMESPACE),
            &["type"],
        )?;
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "The type and status of requests")
                .namespace(PROMETHEUS_NAMESPACE),
            &["type", "status"],
        )?;
        let bridge_status = IntCounterVec::new(
            Opts::new(
                "bridge_status_total",
                "The number of functional and dysfunctional bridges",
            )
            .namespace(PROMETHEUS_NAMESPACE),
            &["status"],
        )?;

        registry.register(Box::new(cache_size.clone()))?;
        registry.register(Box::new(pending_reqs.clone()))?;
        registry.register(Box::new(pending_events.clone()))?;
        registry.register(Box::new(frac_functional.clone()))?;
        registry.register(Box::new(tor_test_time.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(cache.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(bridge_status.clone()))?;

        Ok(Self {
            registry,
            cache_size,
            pending_reqs,
            pending_events,
            frac_functional,
            tor_test_time,
            events,
            cache,
            requests,
            bridge_status,
        })
    }

    /// Renders all metrics in the prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
