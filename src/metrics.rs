//! Prometheus metrics for the connection pool.
//!
//! Metrics cover slot accounting (enrolled, borrowed, live handles),
//! acquisition outcomes, slot invalidation, and embedded server launches.
//!
//! All metrics are registered to a custom registry with the `reservoir`
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are handled gracefully: if a
//! metric fails to register, a detached fallback metric is used instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for pool metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("reservoir".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("gauge options are static and valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    gauge
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("counter options are static and valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    counter
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(opts!(name, help), labels)
        .expect("counter options are static and valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    counter
}

/// Number of slots currently enrolled in the pool (idle + borrowed).
pub static POOL_SLOTS: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge_safe(&REGISTRY, "pool_slots", "Slots enrolled in the pool"));

/// Number of connections currently borrowed from the pool.
pub static BORROWED_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "borrowed_connections",
        "Connections currently checked out",
    )
});

/// Acquisition outcomes, labelled by status: `reused`, `opened`, `retried`,
/// `timeout`, `failed`.
pub static ACQUISITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "acquisitions_total",
        "Connection acquisitions by outcome",
        &["status"],
    )
});

/// Slots permanently removed after exhausting their failure budget or by
/// explicit invalidation.
pub static INVALIDATED_SLOTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_safe(
        &REGISTRY,
        "invalidated_slots_total",
        "Slots permanently removed from the pool",
    )
});

/// Embedded server processes launched by the pool.
pub static EMBEDDED_STARTUPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_safe(
        &REGISTRY,
        "embedded_startups_total",
        "Embedded server processes launched",
    )
});

/// Render all pool metrics in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_without_panic() {
        POOL_SLOTS.set(2);
        BORROWED_CONNECTIONS.set(1);
        ACQUISITIONS.with_label_values(&["reused"]).inc();
        INVALIDATED_SLOTS.inc();
        EMBEDDED_STARTUPS.inc();
    }

    #[test]
    fn test_gather_produces_text() {
        POOL_SLOTS.set(3);
        let text = gather();
        assert!(text.contains("reservoir_pool_slots"));
    }
}
