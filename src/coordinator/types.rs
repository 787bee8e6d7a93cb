//! Replicator state and per-pass bookkeeping types.
//!
//! # State Transitions
//!
//! ```text
//!              run_once()
//! Idle ──────────────────────→ Replicating
//!  ↑                               │
//!  │                               │ (reconciler replicas touched)
//!  │                               ↓
//!  ├───────────────────── ReplicatingReconcilers
//!  │
//!  │ shutdown()
//!  ↓
//! Stopped
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Between passes.
    Idle,

    /// Base per-partition pass in progress.
    Replicating,

    /// Reconciler fan-out (replicate, then clean up) in progress.
    ReplicatingReconcilers,

    /// `run_forever` has exited.
    Stopped,
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorState::Idle => write!(f, "Idle"),
            ReplicatorState::Replicating => write!(f, "Replicating"),
            ReplicatorState::ReplicatingReconcilers => write!(f, "ReplicatingReconcilers"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counters mirrored from the metrics facade for in-process inspection.
///
/// Cumulative over the lifetime of the replicator.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    /// Object replication skipped because the broker has shard ranges.
    pub deferred: AtomicU64,
    pub policy_corrections: AtomicU64,
    pub reconciler_feeds_ok: AtomicU64,
    pub reconciler_feeds_failed: AtomicU64,
    pub rows_enqueued: AtomicU64,
    pub sync_point_advances: AtomicU64,
    pub reconcilers_replicated: AtomicU64,
    pub reconcilers_cleaned: AtomicU64,
    pub passes: AtomicU64,
}

impl ReplicationStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            deferred: self.deferred.load(Ordering::Relaxed),
            policy_corrections: self.policy_corrections.load(Ordering::Relaxed),
            reconciler_feeds_ok: self.reconciler_feeds_ok.load(Ordering::Relaxed),
            reconciler_feeds_failed: self.reconciler_feeds_failed.load(Ordering::Relaxed),
            rows_enqueued: self.rows_enqueued.load(Ordering::Relaxed),
            sync_point_advances: self.sync_point_advances.load(Ordering::Relaxed),
            reconcilers_replicated: self.reconcilers_replicated.load(Ordering::Relaxed),
            reconcilers_cleaned: self.reconcilers_cleaned.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ReplicationStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub deferred: u64,
    pub policy_corrections: u64,
    pub reconciler_feeds_ok: u64,
    pub reconciler_feeds_failed: u64,
    pub rows_enqueued: u64,
    pub sync_point_advances: u64,
    pub reconcilers_replicated: u64,
    pub reconcilers_cleaned: u64,
    pub passes: u64,
}

/// What the base replicator reports for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassReport {
    pub attempted: u64,
    pub success: u64,
    pub failure: u64,
    pub no_change: u64,
    pub removed: u64,
}

/// Result of the reconciler fan-out phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanoutReport {
    pub replicated: usize,
    pub replicate_failures: usize,
    pub cleaned: usize,
    pub cleanup_failures: usize,
}
