//! Prometheus metrics for the change-feed processor.
//!
//! Metrics cover lease operations (create/acquire/renew/checkpoint/release/
//! delete), partition ownership, dispatched batches and records, and health
//! events.
//!
//! All metrics live in a custom registry with the `changeling` prefix to
//! avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors fall back to unregistered metrics instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Custom Prometheus registry for changeling metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("changeling".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("invalid metric definition {name}: {e}"));
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, continuing unregistered");
    }
    counter
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help)
        .unwrap_or_else(|e| panic!("invalid metric definition {name}: {e}"));
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, continuing unregistered");
    }
    gauge
}

/// Lease operations by operation and outcome.
pub static LEASE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "lease_operations_total",
        "Lease store operations by operation and outcome",
        &["operation", "status"],
    )
});

/// Number of partitions this host currently supervises.
pub static OWNED_PARTITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "owned_partitions",
        "Number of partitions currently supervised by this host",
    )
});

/// Batches handed to observers, by partition.
pub static BATCHES_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "batches_dispatched_total",
        "Change batches handed to observers",
        &["partition"],
    )
});

/// Records handed to observers, by partition.
pub static RECORDS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "records_dispatched_total",
        "Change records handed to observers",
        &["partition"],
    )
});

/// Health events by kind and severity.
pub static HEALTH_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "health_events_total",
        "Health events reported to the health monitor",
        &["kind", "severity"],
    )
});

/// Record the outcome of a lease operation.
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a batch dispatched to an observer.
pub fn record_dispatch(partition_id: &str, record_count: usize) {
    BATCHES_DISPATCHED.with_label_values(&[partition_id]).inc();
    RECORDS_DISPATCHED
        .with_label_values(&[partition_id])
        .inc_by(record_count as u64);
}

/// Record a health event.
pub fn record_health_event(kind: &str, severity: &str) {
    HEALTH_EVENTS.with_label_values(&[kind, severity]).inc();
}

/// Encode the registry in the Prometheus text exposition format.
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
    fn record_and_gather() {
        record_lease_operation("acquire", "success");
        record_dispatch("0", 12);
        record_health_event("observer", "warning");

        let text = gather();
        assert!(text.contains("changeling_lease_operations_total"));
        assert!(text.contains("changeling_records_dispatched_total"));
    }

    #[test]
    fn owned_partitions_gauge() {
        OWNED_PARTITIONS.set(0);
        OWNED_PARTITIONS.inc();
        OWNED_PARTITIONS.inc();
        OWNED_PARTITIONS.dec();
        assert_eq!(OWNED_PARTITIONS.get(), 1);
    }
}
