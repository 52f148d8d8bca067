//! Counters and gauges the core emits. Exporting them (Prometheus scrape
//! endpoint, StatsD push, whatever) is an external wiring concern; this
//! module only owns the numbers.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

/// Cloned (`Arc`-wrapped by the caller) into every component so they all
/// update the same underlying series.
pub struct CoreMetrics {
    pub presence_count: IntGauge,
    pub event_dispatch_latency: Histogram,
    pub presence_events_dropped_total: IntCounter,
    pub sessions_disconnected_total: IntCounter,
    pub matches_created_total: IntCounter,
    pub matches_terminated_total: IntCounter,
    pub join_attempts_total: IntCounter,
    pub join_attempts_timed_out_total: IntCounter,
}

impl CoreMetrics {
    /// Build a fresh metric set and register it with `registry`.
    pub fn new(registry: &Registry) -> Self {
        let presence_count =
            IntGauge::new("nakama_core_presence_count", "Live presences tracked").unwrap();
        let event_dispatch_latency = Histogram::with_opts(HistogramOpts::new(
            "nakama_core_event_dispatch_latency_seconds",
            "Time from enqueue to delivery for a presence event batch",
        ))
        .unwrap();
        let presence_events_dropped_total = IntCounter::new(
            "nakama_core_presence_events_dropped_total",
            "Presence event batches dropped due to queue overflow",
        )
        .unwrap();
        let sessions_disconnected_total = IntCounter::new(
            "nakama_core_sessions_disconnected_total",
            "Sessions removed from the session registry",
        )
        .unwrap();
        let matches_created_total = IntCounter::new(
            "nakama_core_matches_created_total",
            "Authoritative matches created",
        )
        .unwrap();
        let matches_terminated_total = IntCounter::new(
            "nakama_core_matches_terminated_total",
            "Authoritative matches terminated",
        )
        .unwrap();
        let join_attempts_total = IntCounter::new(
            "nakama_core_join_attempts_total",
            "Match join attempts processed",
        )
        .unwrap();
        let join_attempts_timed_out_total = IntCounter::new(
            "nakama_core_join_attempts_timed_out_total",
            "Match join attempts that hit the deadline",
        )
        .unwrap();

        for collector in [
            Box::new(presence_count.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(event_dispatch_latency.clone()),
            Box::new(presence_events_dropped_total.clone()),
            Box::new(sessions_disconnected_total.clone()),
            Box::new(matches_created_total.clone()),
            Box::new(matches_terminated_total.clone()),
            Box::new(join_attempts_total.clone()),
            Box::new(join_attempts_timed_out_total.clone()),
        ] {
            // A duplicate registration would indicate a programming error
            // (two `CoreMetrics` on one registry); never surface that to
            // callers of the realtime core.
            let _ = registry.register(collector);
        }

        Self {
            presence_count,
            event_dispatch_latency,
            presence_events_dropped_total,
            sessions_disconnected_total,
            matches_created_total,
            matches_terminated_total,
            join_attempts_total,
            join_attempts_timed_out_total,
        }
    }

    /// A metric set with no attached registry, for tests and for embedding
    /// contexts that export metrics some other way.
    pub fn standalone() -> Self {
        Self::new(&Registry::new())
    }
}
