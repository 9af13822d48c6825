// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Continuous applier throughput and lag
//! - Full and incremental synchronization runs
//! - Snapshot batches
//! - Progress persistence
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use collection_replication::metrics;
//! use std::time::Duration;
//!
//! // In the applier after tailing a chunk
//! metrics::record_entries_fetched("users", 42);
//!
//! // After a synchronization run
//! metrics::record_sync("users", "incremental", true, Duration::from_millis(50));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Applier Metrics
// =============================================================================

/// Record log entries fetched from the leader.
pub fn record_entries_fetched(collection: &str, count: usize) {
    counter!("replication_entries_fetched_total", "collection" => collection.to_string())
        .increment(count as u64);
}

/// Record tail request latency.
pub fn record_fetch_latency(collection: &str, duration: Duration) {
    histogram!("replication_fetch_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Record time spent applying one fetched chunk.
pub fn record_apply_latency(collection: &str, duration: Duration) {
    histogram!("replication_apply_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Record document writes applied locally.
pub fn record_documents_applied(collection: &str, count: usize) {
    if count > 0 {
        counter!("replication_documents_applied_total", "collection" => collection.to_string())
            .increment(count as u64);
    }
}

/// Record removals applied locally.
pub fn record_removals_applied(collection: &str, count: usize) {
    if count > 0 {
        counter!("replication_removals_applied_total", "collection" => collection.to_string())
            .increment(count as u64);
    }
}

/// Record a replicated transaction outcome (`committed` or `aborted`).
pub fn record_transaction(collection: &str, outcome: &str) {
    counter!(
        "replication_transactions_total",
        "collection" => collection.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record unique-constraint conflicts resolved by removing a local document.
pub fn record_conflicts_resolved(collection: &str, count: usize) {
    if count > 0 {
        counter!("replication_conflicts_resolved_total", "collection" => collection.to_string())
            .increment(count as u64);
    }
}

/// Record a retried tail request.
pub fn record_fetch_retry(collection: &str) {
    counter!("replication_fetch_retries_total", "collection" => collection.to_string()).increment(1);
}

/// Record a tail that started inside the compacted part of the leader's log.
pub fn record_not_from_present(collection: &str) {
    counter!("replication_not_from_present_total", "collection" => collection.to_string()).increment(1);
}

/// Gauge for the last applied tick.
pub fn set_applied_tick(collection: &str, tick: u64) {
    gauge!("replication_applied_tick", "collection" => collection.to_string()).set(tick as f64);
}

/// Gauge for how many ticks the follower trails the leader.
pub fn set_applier_lag(collection: &str, lag_ticks: u64) {
    gauge!("replication_lag_ticks", "collection" => collection.to_string()).set(lag_ticks as f64);
}

/// Gauge for applier liveness (1 = running).
pub fn set_applier_running(collection: &str, running: bool) {
    let value = if running { 1.0 } else { 0.0 };
    gauge!("replication_applier_running", "collection" => collection.to_string()).set(value);
}

/// Record errors by class.
pub fn record_error(collection: &str, class: &str) {
    counter!(
        "replication_errors_total",
        "collection" => collection.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

// =============================================================================
// Synchronization Metrics
// =============================================================================

/// Record a synchronization run (`mode` is `full` or `incremental`).
pub fn record_sync(collection: &str, mode: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_sync_runs_total",
        "collection" => collection.to_string(),
        "mode" => mode.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "replication_sync_duration_seconds",
        "collection" => collection.to_string(),
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record documents written and removed by a synchronization run.
pub fn record_sync_documents(collection: &str, inserted: u64, removed: u64) {
    let collection = collection.to_string();
    counter!("replication_sync_documents_inserted_total", "collection" => collection.clone()).increment(inserted);
    counter!("replication_sync_documents_removed_total", "collection" => collection).increment(removed);
}

/// Record divergent key ranges found by a tree comparison.
pub fn record_divergent_ranges(collection: &str, count: usize) {
    histogram!("replication_divergent_ranges", "collection" => collection.to_string()).record(count as f64);
}

/// Record a consistency verification result.
pub fn record_verification(collection: &str, consistent: bool) {
    let result = if consistent { "consistent" } else { "divergent" };
    counter!(
        "replication_verifications_total",
        "collection" => collection.to_string(),
        "result" => result
    )
    .increment(1);
}

// =============================================================================
// Batch Metrics
// =============================================================================

/// Record a snapshot batch lease.
pub fn record_batch_created() {
    counter!("replication_batches_created_total").increment(1);
}

/// Record batches collected after their lease ran out.
pub fn record_batches_expired(count: usize) {
    counter!("replication_batches_expired_total").increment(count as u64);
}

// =============================================================================
// Progress Store Metrics
// =============================================================================

/// Record progress flush batch (debounced writes).
pub fn record_progress_flush(flushed: usize, errors: usize) {
    counter!("replication_progress_flushes_total").increment(1);
    counter!("replication_progress_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_progress_flush_errors_total").increment(errors as u64);
    }
}

/// Record progress SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn progress_retries_total(operation: &str) {
    counter!("replication_progress_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Manager Metrics
// =============================================================================

/// Gauge for manager state.
pub fn set_manager_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_manager_state").set(value);
}

/// Gauge for the number of running appliers.
pub fn set_running_appliers(count: usize) {
    gauge!("replication_running_appliers").set(count as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "replication_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}
