// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication pass.
//!
//! [`ReplicationPass`] is built fresh by `run_once`, handed to the base
//! replicator as its [`ReplicationDriver`], and dropped at the end of the
//! pass. It owns the two per-pass caches:
//!
//! - the reconciler cache: queue replicas created or opened while feeding,
//!   replicated to their primaries once the base loop is done;
//! - the cleanup cache: queue replicas the base loop wanted to delete
//!   (found on a handoff), deleted only after the fan-out has replicated them.
//!
//! Both caches are disabled (`None`) at the end of
//! [`replicate_reconcilers`](ReplicationPass::replicate_reconcilers), after
//! which `delete_broker` deletes immediately.

use super::shard_sync::{fetch_and_merge_shard_ranges, sync_other_items};
use super::types::{FanoutReport, ReplicationStats};
use crate::broker::{Broker, BrokerFactory, ReplicationInfo};
use crate::config::ReplicatorConfig;
use crate::driver::{AsDriver, BaseReplicator, HookFuture, ReplicationDriver, SyncArgs, SyncExchange};
use crate::error::Result;
use crate::metrics;
use crate::peer::PeerResponse;
use crate::policy::{apply_policy_correction, PolicyState};
use crate::reconciler::{ReconcilerCache, ReconcilerFeeder, ReconcilerNaming, ReconcilerTarget};
use crate::resilience::{run_bounded, Bulkhead};
use crate::ring::Ring;
use crate::sync_store::SyncStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Queue replicas awaiting deletion, keyed by database path.
pub type CleanupCache = Mutex<Option<HashMap<String, Arc<dyn Broker>>>>;

/// Per-pass context and the container-aware [`ReplicationDriver`].
pub struct ReplicationPass<'r> {
    config: &'r ReplicatorConfig,
    base: &'r dyn BaseReplicator,
    ring: &'r dyn Ring,
    brokers: &'r dyn BrokerFactory,
    sync_store: &'r dyn SyncStore,
    naming: &'r ReconcilerNaming,
    stats: &'r ReplicationStats,
    local_device_ids: HashSet<u32>,
    reconciler_cache: ReconcilerCache,
    cleanup_cache: CleanupCache,
}

impl<'r> ReplicationPass<'r> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'r ReplicatorConfig,
        base: &'r dyn BaseReplicator,
        ring: &'r dyn Ring,
        brokers: &'r dyn BrokerFactory,
        sync_store: &'r dyn SyncStore,
        naming: &'r ReconcilerNaming,
        stats: &'r ReplicationStats,
    ) -> Self {
        Self {
            config,
            base,
            ring,
            brokers,
            sync_store,
            naming,
            stats,
            local_device_ids: base.local_device_ids(),
            reconciler_cache: Mutex::new(Some(HashMap::new())),
            cleanup_cache: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Feeder bound to this pass's reconciler cache.
    pub fn feeder(&self) -> ReconcilerFeeder<'_> {
        ReconcilerFeeder::new(
            self.ring,
            self.brokers,
            self.naming,
            &self.local_device_ids,
            self.config.per_diff,
            &self.reconciler_cache,
            self.stats,
        )
    }

    /// Queue replicas touched so far, by bucket name.
    pub async fn reconciler_targets(&self) -> Vec<(String, ReconcilerTarget)> {
        let cache = self.reconciler_cache.lock().await;
        let mut targets: Vec<_> = cache
            .iter()
            .flat_map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }

    /// Database paths of queue replicas waiting for deletion.
    pub async fn pending_cleanups(&self) -> Vec<String> {
        let cache = self.cleanup_cache.lock().await;
        let mut paths: Vec<_> = cache.iter().flat_map(|c| c.keys().cloned()).collect();
        paths.sort();
        paths
    }

    /// Whether either cache holds anything.
    pub async fn has_reconciler_work(&self) -> bool {
        let fed = self.reconciler_cache.lock().await.as_ref().is_some_and(|c| !c.is_empty());
        let cleanups = self.cleanup_cache.lock().await.as_ref().is_some_and(|c| !c.is_empty());
        fed || cleanups
    }

    /// Whether the caches are still collecting (before the fan-out).
    pub async fn caches_active(&self) -> bool {
        self.reconciler_cache.lock().await.is_some() && self.cleanup_cache.lock().await.is_some()
    }

    /// Replicate every queue replica touched this pass, then delete the ones
    /// flagged for cleanup.
    ///
    /// All replications finish before any deletion starts. Task failures are
    /// logged and counted, never returned.
    #[instrument(skip_all, fields(node_id = %self.config.node_id))]
    pub async fn replicate_reconcilers(&self) -> FanoutReport {
        let start = Instant::now();
        let mut report = FanoutReport::default();
        let bulkhead = Bulkhead::new(self.config.concurrency);

        let targets: Vec<ReconcilerTarget> = self
            .reconciler_targets()
            .await
            .into_iter()
            .map(|(_, target)| target)
            .collect();
        info!(count = targets.len(), "Replicating reconciler containers");

        let driver = self.as_driver();
        let replications = targets
            .iter()
            .map(|target| async move {
                let result = self
                    .base
                    .replicate_object(driver, target.partition, target.broker.clone(), target.node_id)
                    .await;
                (target, result)
            })
            .collect();
        for outcome in run_bounded(&bulkhead, replications).await.into_iter().flatten() {
            match outcome {
                (_, Ok(true)) => report.replicated += 1,
                (target, Ok(false)) => {
                    debug!(db_file = %target.broker.identity().db_file, "Reconciler replication incomplete");
                    report.replicate_failures += 1;
                }
                (target, Err(e)) => {
                    error!(
                        db_file = %target.broker.identity().db_file,
                        partition = target.partition,
                        error = %e,
                        "Failed to replicate reconciler container"
                    );
                    metrics::record_fanout_error("replicate");
                    report.replicate_failures += 1;
                }
            }
        }

        // Disabling the caches makes delete_broker delete for real
        let cleanups: Vec<Arc<dyn Broker>> = {
            let mut cache = self.cleanup_cache.lock().await;
            let mut cleanups: Vec<_> = cache.take().unwrap_or_default().into_iter().collect();
            cleanups.sort_by(|a, b| a.0.cmp(&b.0));
            cleanups.into_iter().map(|(_, broker)| broker).collect()
        };
        self.reconciler_cache.lock().await.take();
        metrics::set_reconciler_containers(0);

        info!(count = cleanups.len(), "Cleaning up reconciler containers");
        let deletions = cleanups
            .iter()
            .map(|broker| async move { (broker, self.delete_broker(broker).await) })
            .collect();
        for outcome in run_bounded(&bulkhead, deletions).await.into_iter().flatten() {
            match outcome {
                (_, Ok(true)) => report.cleaned += 1,
                (broker, Ok(false)) => {
                    debug!(db_file = %broker.identity().db_file, "Reconciler container kept");
                    report.cleanup_failures += 1;
                }
                (broker, Err(e)) => {
                    error!(db_file = %broker.identity().db_file, error = %e, "Failed to clean up reconciler container");
                    metrics::record_fanout_error("cleanup");
                    report.cleanup_failures += 1;
                }
            }
        }

        ReplicationStats::add(&self.stats.reconcilers_replicated, report.replicated as u64);
        ReplicationStats::add(&self.stats.reconcilers_cleaned, report.cleaned as u64);
        metrics::record_reconciler_fanout(report.replicated, report.cleaned, start.elapsed());
        info!(
            replicated = report.replicated,
            cleaned = report.cleaned,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished reconciler replication"
        );
        report
    }
}

impl ReplicationDriver for ReplicationPass<'_> {
    fn base(&self) -> &dyn BaseReplicator {
        self.base
    }

    fn gather_sync_args(&self, info: &ReplicationInfo) -> SyncArgs {
        let args = self.base.gather_sync_args(info);
        if self.config.is_multi_policy() {
            args.with_policy(info)
        } else {
            args
        }
    }

    fn handle_sync_response<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        response: PeerResponse,
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            if response.is_success() {
                let remote: ReplicationInfo = response.json()?;
                let broker = exchange.broker.as_ref();
                let local = exchange.local_info;

                if apply_policy_correction(broker, local, &PolicyState::from(&remote), "replicator").await? {
                    ReplicationStats::incr(&self.stats.policy_corrections);
                }
                if local.created_at != remote.created_at
                    || local.put_timestamp != remote.put_timestamp
                    || local.delete_timestamp != remote.delete_timestamp
                {
                    broker
                        .merge_timestamps(remote.created_at, remote.put_timestamp, remote.delete_timestamp)
                        .await?;
                }
                fetch_and_merge_shard_ranges(exchange.peer, broker).await;
            }
            self.base.handle_sync_response(self, exchange, response).await
        })
    }

    fn in_sync<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        remote: &'a ReplicationInfo,
        local_sync: i64,
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            // Shard ranges are resent every pass, so never short-circuit
            if !exchange.broker.get_shard_ranges(true, true).await?.is_empty() {
                return Ok(false);
            }
            Ok(self.base.in_sync(remote, exchange.local_info, local_sync))
        })
    }

    fn choose_replication_mode<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        remote: &'a ReplicationInfo,
        local_sync: i64,
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            let broker = exchange.broker.as_ref();
            let shard_range_success = sync_other_items(broker, exchange.peer, &exchange.local_info.id).await;

            let shard_ranges = broker.get_shard_ranges(false, false).await?;
            if !shard_ranges.is_empty() {
                warn!(
                    db_file = %broker.identity().db_file,
                    peer = %exchange.peer.node().address(),
                    shard_ranges = shard_ranges.len(),
                    "Able to shard, refusing to replicate objects to peer; waiting for cleaving"
                );
                ReplicationStats::incr(&self.stats.deferred);
                metrics::record_deferred();
                return Ok(shard_range_success);
            }

            let success = self.base.choose_replication_mode(exchange, remote, local_sync).await?;
            Ok(shard_range_success && success)
        })
    }

    fn post_replicate_hook<'a>(
        &'a self,
        broker: &'a Arc<dyn Broker>,
        info: &'a ReplicationInfo,
        responses: &'a [bool],
    ) -> HookFuture<'a, ()> {
        Box::pin(async move {
            if self.naming.is_reserved(&info.account) {
                return Ok(());
            }

            if let Err(e) = self.sync_store.update_sync_store(broker.as_ref()).await {
                warn!(db_file = %broker.identity().db_file, error = %e, "Failed to update sync_store");
            }

            let outcome = self.feeder().advance_sync_point(broker.as_ref(), info, responses).await?;
            debug!(db_file = %broker.identity().db_file, ?outcome, "Reconciler sync point checked");
            Ok(())
        })
    }

    fn cleanup_after_replicate<'a>(
        &'a self,
        broker: &'a Arc<dyn Broker>,
        info: &'a ReplicationInfo,
        responses: &'a [bool],
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            if broker.requires_sharding().await? {
                let state = broker.db_state().await?;
                debug!(
                    db_file = %broker.identity().db_file,
                    state = %state,
                    "Not deleting db (requires sharding)"
                );
                return Ok(true);
            }
            self.base.cleanup_after_replicate(self, broker, info, responses).await
        })
    }

    fn delete_broker<'a>(&'a self, broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool> {
        Box::pin(async move {
            let identity = broker.identity();
            {
                let mut cache = self.cleanup_cache.lock().await;
                if let Some(cleanups) = cache.as_mut() {
                    if self.naming.is_reserved(&identity.account) {
                        // Deleted after the fan-out has replicated it; not
                        // gone yet
                        cleanups.insert(identity.db_file.clone(), broker.clone());
                        return Ok(false);
                    }
                }
            }

            if let Err(e) = self.sync_store.remove_synced_container(broker.as_ref()).await {
                warn!(db_file = %identity.db_file, error = %e, "Failed to remove sync_store entry");
            }
            self.base.delete_broker(broker).await
        })
    }

    fn is_locked<'a>(&'a self, broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool> {
        Box::pin(async move { Ok(broker.has_sharding_lock().await?) })
    }

    fn report_up_to_date(&self, info: &ReplicationInfo) -> bool {
        info.reported_put_timestamp == info.put_timestamp
            && info.reported_delete_timestamp == info.delete_timestamp
            && info.reported_object_count == info.object_count
            && info.reported_bytes_used == info.bytes_used
    }
}
