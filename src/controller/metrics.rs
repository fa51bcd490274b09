//! Prometheus metrics for the node controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `fleet_reconcile_duration_seconds` (histogram): reconcile cycle duration labeled by node.
//! - `fleet_reconcile_errors_total` (counter): errors labeled by controller step and error kind.
//! - `fleet_held_users` (gauge): users in the held snapshot labeled by node.
//! - `fleet_node_rebuilds_total` (counter): teardown-then-rebuild of node resources labeled by node.
//! - `fleet_reported_traffic_bytes_total` (counter): confirmed reported traffic labeled by node and direction.
//! - `fleet_scheduler_task_failures_total` (counter): failed or panicked periodic task runs labeled by task.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for per-node metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node_id: String,
}

/// Labels for controller error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller step, e.g. "fetch_node", "add_limiter"
    pub step: String,
    /// Error kind, e.g. "control_plane", "engine"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TrafficLabels {
    pub node_id: String,
    /// "upload" or "download"
    pub direction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub task: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<NodeLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking controller step errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static HELD_USERS: Lazy<Family<NodeLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static NODE_REBUILDS_TOTAL: Lazy<Family<NodeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REPORTED_TRAFFIC_BYTES_TOTAL: Lazy<Family<TrafficLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static SCHEDULER_TASK_FAILURES_TOTAL: Lazy<Family<TaskLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "fleet_reconcile_duration_seconds",
        "Duration of reconcile cycles in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "fleet_reconcile_errors",
        "Total number of controller step errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "fleet_held_users",
        "Number of users in the held snapshot",
        HELD_USERS.clone(),
    );
    registry.register(
        "fleet_node_rebuilds",
        "Total number of node resource rebuilds",
        NODE_REBUILDS_TOTAL.clone(),
    );
    registry.register(
        "fleet_reported_traffic_bytes",
        "Traffic bytes confirmed by the control plane",
        REPORTED_TRAFFIC_BYTES_TOTAL.clone(),
    );
    registry.register(
        "fleet_scheduler_task_failures",
        "Total number of failed periodic task runs",
        SCHEDULER_TASK_FAILURES_TOTAL.clone(),
    );

    registry
});

fn node(node_id: u32) -> NodeLabels {
    NodeLabels {
        node_id: node_id.to_string(),
    }
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(node_id: u32, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&node(node_id))
        .observe(seconds);
}

/// Increment the step error counter.
pub fn inc_reconcile_error(step: &str, kind: &str) {
    let labels = ErrorLabels {
        step: step.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_held_users(node_id: u32, count: usize) {
    HELD_USERS
        .get_or_create(&node(node_id))
        .set(count as i64);
}

pub fn inc_node_rebuild(node_id: u32) {
    NODE_REBUILDS_TOTAL.get_or_create(&node(node_id)).inc();
}

pub fn add_reported_traffic(node_id: u32, upload: u64, download: u64) {
    for (direction, bytes) in [("upload", upload), ("download", download)] {
        let labels = TrafficLabels {
            node_id: node_id.to_string(),
            direction: direction.to_string(),
        };
        REPORTED_TRAFFIC_BYTES_TOTAL
            .get_or_create(&labels)
            .inc_by(bytes);
    }
}

pub fn inc_task_failure(task: &str) {
    let labels = TaskLabels {
        task: task.to_string(),
    };
    SCHEDULER_TASK_FAILURES_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in Prometheus text exposition format
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_renders_registered_families() {
        inc_reconcile_error("fetch_node", "control_plane");
        set_held_users(7, 2);
        let text = render().unwrap();
        assert!(text.contains("fleet_reconcile_errors_total"));
        assert!(text.contains("fleet_held_users"));
    }

    #[test]
    fn test_traffic_counter_accumulates() {
        add_reported_traffic(4242, 10, 20);
        add_reported_traffic(4242, 5, 0);
        let labels = TrafficLabels {
            node_id: "4242".to_string(),
            direction: "upload".to_string(),
        };
        assert_eq!(REPORTED_TRAFFIC_BYTES_TOTAL.get_or_create(&labels).get(), 15);
    }

    #[test]
    fn test_observe_reconcile_duration() {
        observe_reconcile_duration_seconds(7, 0.25);
        // Function should not panic
    }
}
