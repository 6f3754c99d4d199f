//! Prometheus metrics for the master
//!
//! This module provides metrics tracking for:
//! - Pool: workers spawned, worker exits, ready workers
//! - Router: connections routed per worker slot, connections rejected
//!
//! Only the master registers metrics; they are served by the admin API.
//!
//! # Usage
//!
//! Call `init_metrics()` at process startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for master-side metrics
struct PoolMetrics {
    workers_spawned: Counter,
    spawn_failures: Counter,
    worker_exits: CounterVec,
    ready_workers: Gauge,
    connections_routed: CounterVec,
    connections_rejected: CounterVec,
}

/// Global storage for pool metrics
static POOL_METRICS: OnceLock<PoolMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at process startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = stickypool::metrics::init_metrics() {
///     tracing::warn!("Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let pool = PoolMetrics {
        workers_spawned: register_counter!(
            "stickypool_workers_spawned_total",
            "Total number of worker processes started"
        )?,
        spawn_failures: register_counter!(
            "stickypool_spawn_failures_total",
            "Total number of failed worker process starts"
        )?,
        worker_exits: register_counter_vec!(
            "stickypool_worker_exits_total",
            "Total worker exits by reason",
            &["reason"]
        )?,
        ready_workers: register_gauge!(
            "stickypool_ready_workers",
            "Number of workers currently eligible for routing"
        )?,
        connections_routed: register_counter_vec!(
            "stickypool_connections_routed_total",
            "Connections handed to a worker, by worker slot",
            &["ordinal"]
        )?,
        connections_rejected: register_counter_vec!(
            "stickypool_connections_rejected_total",
            "Connections closed by the master without a handoff",
            &["reason"]
        )?,
    };

    POOL_METRICS.set(pool).map_err(|_| "Pool metrics already initialized")?;

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    POOL_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a started worker process
pub fn record_worker_spawned() {
    if let Some(m) = POOL_METRICS.get() {
        m.workers_spawned.inc();
    }
}

/// Record a failed worker start
pub fn record_spawn_failure() {
    if let Some(m) = POOL_METRICS.get() {
        m.spawn_failures.inc();
    }
}

/// Record a worker exit
pub fn record_worker_exit(reason: &str) {
    if let Some(m) = POOL_METRICS.get() {
        m.worker_exits.with_label_values(&[reason]).inc();
    }
}

/// Update the ready worker gauge
pub fn set_ready_workers(count: usize) {
    if let Some(m) = POOL_METRICS.get() {
        m.ready_workers.set(count as f64);
    }
}

/// Record a connection handed to the worker at `ordinal`
pub fn record_connection_routed(ordinal: usize) {
    let Some(m) = POOL_METRICS.get() else {
        return;
    };

    let ordinal_str = ordinal.to_string();
    m.connections_routed
        .with_label_values(&[ordinal_str.as_str()])
        .inc();
}

/// Record a connection closed by the master
pub fn record_connection_rejected(reason: &str) {
    if let Some(m) = POOL_METRICS.get() {
        m.connections_rejected.with_label_values(&[reason]).inc();
    }
}

// ============================================================================
// Tests
// ============================================================================
