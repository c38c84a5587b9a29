//! Prometheus metrics for masters and crawl workers
//!
//! This module tracks:
//! - Master: leadership, worker membership, assignments
//! - Engine: scheduler queue depth, fetch outcomes, discards, retries, stored records
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

struct MasterMetrics {
    is_leader: Gauge,
    worker_nodes: Gauge,
    resources: Gauge,
    assignments: CounterVec,
    api_requests: CounterVec,
}

struct EngineMetrics {
    queue_depth: GaugeVec,
    running_tasks: Gauge,
    fetches: CounterVec,
    discards: CounterVec,
    retries: Counter,
    stored_records: CounterVec,
}

static MASTER_METRICS: OnceLock<MasterMetrics> = OnceLock::new();

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
/// If registration fails, subsequent metric operations become no-ops.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let master = MasterMetrics {
        is_leader: register_gauge!(
            "crawlnet_master_is_leader",
            "Whether this master currently holds leadership (1 = yes, 0 = no)"
        )?,
        worker_nodes: register_gauge!(
            "crawlnet_master_worker_nodes",
            "Number of worker nodes in the current membership view"
        )?,
        resources: register_gauge!(
            "crawlnet_master_resources",
            "Number of resources tracked by this master"
        )?,
        assignments: register_counter_vec!(
            "crawlnet_master_assignments_total",
            "Resource assignments by target node",
            &["node"]
        )?,
        api_requests: register_counter_vec!(
            "crawlnet_master_api_requests_total",
            "API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
    };

    let engine = EngineMetrics {
        queue_depth: register_gauge_vec!(
            "crawlnet_scheduler_queue_depth",
            "Requests waiting in the scheduler by queue",
            &["queue"]
        )?,
        running_tasks: register_gauge!(
            "crawlnet_worker_running_tasks",
            "Tasks currently active on this worker"
        )?,
        fetches: register_counter_vec!(
            "crawlnet_worker_fetches_total",
            "Fetches by task and outcome",
            &["task", "outcome"]
        )?,
        discards: register_counter_vec!(
            "crawlnet_worker_discards_total",
            "Requests discarded without retry by reason",
            &["reason"]
        )?,
        retries: register_counter!(
            "crawlnet_worker_retries_total",
            "Requests resubmitted after a transient failure"
        )?,
        stored_records: register_counter_vec!(
            "crawlnet_sink_stored_records_total",
            "Records handed to task storage",
            &["task"]
        )?,
    };

    MASTER_METRICS
        .set(master)
        .map_err(|_| "Master metrics already initialized")?;
    ENGINE_METRICS
        .set(engine)
        .map_err(|_| "Engine metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

pub fn metrics_initialized() -> bool {
    MASTER_METRICS.get().is_some() && ENGINE_METRICS.get().is_some()
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

pub fn set_leader(is_leader: bool) {
    if let Some(m) = MASTER_METRICS.get() {
        m.is_leader.set(if is_leader { 1.0 } else { 0.0 });
    }
}

pub fn update_membership(nodes: usize, resources: usize) {
    if let Some(m) = MASTER_METRICS.get() {
        m.worker_nodes.set(nodes as f64);
        m.resources.set(resources as f64);
    }
}

pub fn record_assignment(node: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.assignments.with_label_values(&[node]).inc();
    }
}

pub fn record_api_request(endpoint: &str, status: u16) {
    if let Some(m) = MASTER_METRICS.get() {
        let status = status.to_string();
        m.api_requests.with_label_values(&[endpoint, &status]).inc();
    }
}

pub fn update_queue_depth(priority: usize, normal: usize) {
    let Some(m) = ENGINE_METRICS.get() else {
        return;
    };
    m.queue_depth
        .with_label_values(&["priority"])
        .set(priority as f64);
    m.queue_depth.with_label_values(&["normal"]).set(normal as f64);
}

pub fn set_running_tasks(count: usize) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.running_tasks.set(count as f64);
    }
}

/// Record a fetch outcome (`ok`, `failed`, `banned`, `short`)
pub fn record_fetch(task: &str, outcome: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.fetches.with_label_values(&[task, outcome]).inc();
    }
}

pub fn record_discard(reason: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.discards.with_label_values(&[reason]).inc();
    }
}

pub fn record_retry() {
    if let Some(m) = ENGINE_METRICS.get() {
        m.retries.inc();
    }
}

pub fn record_stored(task: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = ENGINE_METRICS.get() {
        m.stored_records
            .with_label_values(&[task])
            .inc_by(count as f64);
    }
}

// ============================================================================
// Tests
// ============================================================================
