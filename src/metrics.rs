//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replication passes and deferred (shard-gated) object replication
//! - Reconciler feeds, enqueued rows, and sync point advancement
//! - Storage policy corrections
//! - Shard range fetches
//! - Reconciler container fan-out
//! - Sync store SQLite retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `container_replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use container_replicator::metrics;
//! use std::time::Duration;
//!
//! // After feeding a reconciler bucket
//! metrics::record_reconciler_feed("1700000000", 42, true);
//!
//! // At the end of a pass
//! metrics::record_pass_complete(Duration::from_secs(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record object replication deferred because the broker has shard ranges.
pub fn record_deferred() {
    counter!("container_replicator_deferred_total").increment(1);
}

/// Record one reconciler bucket feed and how many entries it carried.
pub fn record_reconciler_feed(bucket: &str, entries: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "container_replicator_reconciler_feeds_total",
        "status" => status
    )
    .increment(1);
    if success {
        counter!(
            "container_replicator_reconciler_rows_enqueued_total",
            "bucket" => bucket.to_string()
        )
        .increment(entries as u64);
    }
}

/// Record a feed that failed because no local device could hold the bucket.
pub fn record_device_unavailable() {
    counter!("container_replicator_device_unavailable_total").increment(1);
}

/// Record a reconciler sync point move (fast-forward or quorum-gated advance).
pub fn record_sync_point_advance(kind: &str, rows: i64) {
    counter!("container_replicator_sync_point_advances_total", "kind" => kind.to_string())
        .increment(1);
    if rows > 0 {
        counter!("container_replicator_sync_point_rows_total").increment(rows as u64);
    }
}

/// Record a sync point advance withheld for lack of quorum.
pub fn record_sync_point_held(reason: &str) {
    counter!("container_replicator_sync_point_held_total", "reason" => reason.to_string())
        .increment(1);
}

/// Record a storage policy index correction and where it happened.
pub fn record_policy_correction(side: &str) {
    counter!("container_replicator_policy_corrections_total", "side" => side.to_string())
        .increment(1);
}

/// Record a shard range fetch from a peer.
pub fn record_shard_range_fetch(success: bool, ranges: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("container_replicator_shard_range_fetches_total", "status" => status).increment(1);
    if success {
        histogram!("container_replicator_shard_range_fetch_size").record(ranges as f64);
    }
}

/// Record a shard range push to a peer ("other items").
pub fn record_shard_range_push(success: bool, ranges: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("container_replicator_shard_range_pushes_total", "status" => status).increment(1);
    counter!("container_replicator_shard_ranges_pushed_total").increment(ranges as u64);
}

/// Record the reconciler fan-out phase.
pub fn record_reconciler_fanout(replicated: usize, cleaned: usize, duration: Duration) {
    counter!("container_replicator_reconciler_replicated_total").increment(replicated as u64);
    counter!("container_replicator_reconciler_cleaned_total").increment(cleaned as u64);
    histogram!("container_replicator_reconciler_fanout_duration_seconds")
        .record(duration.as_secs_f64());
}

/// Record a fan-out task failure.
pub fn record_fanout_error(phase: &str) {
    counter!("container_replicator_fanout_errors_total", "phase" => phase.to_string())
        .increment(1);
}

/// Record a completed replication pass.
pub fn record_pass_complete(duration: Duration) {
    counter!("container_replicator_passes_total").increment(1);
    histogram!("container_replicator_pass_duration_seconds").record(duration.as_secs_f64());
    gauge!("container_replicator_last_pass_duration_seconds").set(duration.as_secs_f64());
}

/// Set the replicator state gauge.
pub fn set_replicator_state(state: &str) {
    // 0=idle, 1=replicating, 2=fan-out, 3=stopped
    let value = match state {
        "Idle" => 0.0,
        "Replicating" => 1.0,
        "ReplicatingReconcilers" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("container_replicator_state").set(value);
}

/// Gauge for the number of reconciler containers touched this pass.
pub fn set_reconciler_containers(count: usize) {
    gauge!("container_replicator_reconciler_containers").set(count as f64);
}

/// Record a sync store failure (never fatal).
pub fn record_sync_store_error(operation: &str) {
    counter!("container_replicator_sync_store_errors_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record sync store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sync_store_retries_total(operation: &str) {
    counter!("container_replicator_sync_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a peer RPC and its latency.
pub fn record_peer_rpc(op: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "container_replicator_peer_rpcs_total",
        "op" => op.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("container_replicator_peer_rpc_duration_seconds", "op" => op.to_string())
        .record(duration.as_secs_f64());
}

/// Record an inbound RPC served to a peer.
pub fn record_rpc_served(op: &str, status: u16) {
    counter!(
        "container_replicator_rpc_served_total",
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
