// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication pass orchestration.
//!
//! [`ContainerReplicator`] ties together:
//! - the generic row-diff replicator ([`BaseReplicator`]), which walks the
//!   local partitions and talks to peers
//! - the container hooks ([`ReplicationPass`]): shard-range exchange, policy
//!   correction, shard gating and reconciler feeding
//! - the reconciler fan-out that runs after every pass
//!
//! # Pass lifecycle
//!
//! 1. A fresh [`ReplicationPass`] is built with empty caches
//! 2. The base replicator runs, calling the pass's hooks per broker
//! 3. If any reconciler replica was touched, the fan-out replicates them and
//!    then deletes the ones queued for cleanup
//! 4. The pass (and its caches) is dropped

mod types;
pub mod pass;
pub mod shard_sync;

pub use pass::ReplicationPass;
pub use types::{FanoutReport, PassReport, ReplicationStats, ReplicatorState, StatsSnapshot};

use crate::broker::BrokerFactory;
use crate::config::ReplicatorConfig;
use crate::driver::BaseReplicator;
use crate::error::Result;
use crate::metrics;
use crate::reconciler::ReconcilerNaming;
use crate::ring::Ring;
use crate::sync_store::SyncStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

/// The container replicator.
///
/// Owns the collaborators a pass needs and runs passes on demand
/// ([`run_once`](Self::run_once)) or on a timer
/// ([`run_forever`](Self::run_forever)).
pub struct ContainerReplicator {
    config: ReplicatorConfig,
    ring: Arc<dyn Ring>,
    brokers: Arc<dyn BrokerFactory>,
    base: Arc<dyn BaseReplicator>,
    sync_store: Arc<dyn SyncStore>,
    naming: ReconcilerNaming,
    stats: ReplicationStats,

    /// Replicator state (broadcast to watchers)
    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ContainerReplicator {
    /// Create a replicator.
    ///
    /// Fails if the configuration does not validate.
    pub fn new(
        config: ReplicatorConfig,
        ring: Arc<dyn Ring>,
        brokers: Arc<dyn BrokerFactory>,
        base: Arc<dyn BaseReplicator>,
        sync_store: Arc<dyn SyncStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let naming = ReconcilerNaming::from_config(&config.reconciler);

        Ok(Self {
            config,
            ring,
            brokers,
            base,
            sync_store,
            naming,
            stats: ReplicationStats::default(),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Current state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ReplicatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_replicator_state(&state.to_string());
    }

    /// Cumulative counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn naming(&self) -> &ReconcilerNaming {
        &self.naming
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Start a pass with empty reconciler and cleanup caches.
    pub fn begin_pass(&self) -> ReplicationPass<'_> {
        ReplicationPass::new(
            &self.config,
            self.base.as_ref(),
            self.ring.as_ref(),
            self.brokers.as_ref(),
            self.sync_store.as_ref(),
            &self.naming,
            &self.stats,
        )
    }

    /// Run one full pass followed by the reconciler fan-out.
    ///
    /// The fan-out runs even when the base pass failed, so queue replicas
    /// created before the failure still reach their primaries.
    #[instrument(skip_all, fields(node_id = %self.config.node_id))]
    pub async fn run_once(&self) -> Result<PassReport> {
        let start = Instant::now();
        self.set_state(ReplicatorState::Replicating);
        info!("Beginning container replication pass");

        let pass = self.begin_pass();
        let result = self.base.run_pass(&pass).await;

        if pass.has_reconciler_work().await {
            self.set_state(ReplicatorState::ReplicatingReconcilers);
            pass.replicate_reconcilers().await;
        } else {
            debug!("No reconciler containers touched");
        }
        drop(pass);

        let elapsed = start.elapsed();
        ReplicationStats::incr(&self.stats.passes);
        metrics::record_pass_complete(elapsed);
        self.set_state(ReplicatorState::Idle);

        match &result {
            Ok(report) => info!(
                attempted = report.attempted,
                success = report.success,
                failure = report.failure,
                no_change = report.no_change,
                removed = report.removed,
                elapsed_ms = elapsed.as_millis() as u64,
                "Replication pass complete"
            ),
            Err(e) => error!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "Replication pass failed"),
        }
        result
    }

    /// Run passes every `interval_sec` until [`shutdown`](Self::shutdown).
    ///
    /// A failed pass is logged and the loop carries on.
    pub async fn run_forever(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut timer = tokio::time::interval(self.config.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            node_id = %self.config.node_id,
            interval_sec = self.config.interval_sec,
            "Starting container replicator"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    // Errors are already logged by run_once
                    let _ = self.run_once().await;
                }
            }
        }

        self.set_state(ReplicatorState::Stopped);
        info!(node_id = %self.config.node_id, "Container replicator stopped");
    }

    /// Ask [`run_forever`](Self::run_forever) to stop after the current pass.
    pub fn shutdown(&self) {
        info!(node_id = %self.config.node_id, "Shutting down container replicator");
        let _ = self.shutdown_tx.send(true);
    }
}
