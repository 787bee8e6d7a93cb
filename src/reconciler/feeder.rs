// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciler feeder: moves misplaced rows into queue containers and decides
//! how far the reconciler sync point may advance.
//!
//! # Cursor safety
//!
//! A container's `reconciler_sync_point` says "every misplaced row at or
//! below this ROWID is in a queue container". The feeder keeps that true:
//!
//! 1. Rows are paged in ROWID order, `per_diff` at a time.
//! 2. A page only moves the low watermark if every bucket in it was fed,
//!    and once any bucket has failed no later page moves it either.
//! 3. The caller only stores the watermark when a majority of peers
//!    accepted this pass's replication.
//!
//! A failed bucket costs a re-feed of some rows on the next pass, which is
//! harmless because queue merges are idempotent.

use super::{ReconcilerCache, ReconcilerNaming, ReconcilerTarget, RowTranslator};
use crate::broker::{Broker, BrokerFactory, BrokerInit, BrokerLocation, ObjectRow, ReplicationInfo};
use crate::coordinator::ReplicationStats;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::quorum::majority_size;
use crate::ring::{Node, Ring};
use crate::timestamp::Timestamp;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What `advance_sync_point` did with the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPointOutcome {
    /// Single policy: cursor moved straight to `max_row`, no drain.
    FastForwarded { from: i64, to: i64 },
    /// Single policy and the cursor was already at `max_row`.
    Current,
    /// Drained and stored the new low watermark.
    Advanced { from: i64, to: i64 },
    /// Drain made no confirmed progress.
    NoProgress,
    /// Drain made progress but too few peers accepted this pass.
    NoQuorum { successes: usize, needed: usize },
}

/// Open (and create if missing) a broker, treating a creation race as success.
pub async fn initialize_broker(
    factory: &dyn BrokerFactory,
    location: &BrokerLocation,
    init: BrokerInit,
) -> Result<Arc<dyn Broker>> {
    let broker = factory.open(location);
    if !broker.exists().await? {
        match broker.initialize(init).await {
            Ok(()) => {}
            Err(e) => {
                let e = ReplicationError::from(e);
                if !e.is_already_exists() {
                    return Err(e);
                }
                debug!(db_file = %broker.identity().db_file, "Broker created concurrently");
            }
        }
    }
    Ok(broker)
}

/// Feeds misplaced rows into reconciler queue containers.
///
/// Borrowed from the current pass; holds no state of its own.
pub struct ReconcilerFeeder<'a> {
    ring: &'a dyn Ring,
    factory: &'a dyn BrokerFactory,
    naming: &'a ReconcilerNaming,
    local_device_ids: &'a HashSet<u32>,
    per_diff: usize,
    cache: &'a ReconcilerCache,
    stats: &'a ReplicationStats,
}

impl<'a> ReconcilerFeeder<'a> {
    pub fn new(
        ring: &'a dyn Ring,
        factory: &'a dyn BrokerFactory,
        naming: &'a ReconcilerNaming,
        local_device_ids: &'a HashSet<u32>,
        per_diff: usize,
        cache: &'a ReconcilerCache,
        stats: &'a ReplicationStats,
    ) -> Self {
        Self {
            ring,
            factory,
            naming,
            local_device_ids,
            per_diff: per_diff.max(1),
            cache,
            stats,
        }
    }

    /// First primary, then handoff, node of `partition` that is a local device.
    pub fn find_local_handoff_for_part(&self, partition: u32) -> Option<Node> {
        self.ring
            .get_part_nodes(partition)
            .into_iter()
            .chain(self.ring.get_more_nodes(partition))
            .find(|node| self.local_device_ids.contains(&node.id))
    }

    /// The local queue replica for rows created at `timestamp`.
    ///
    /// Fails with [`ReplicationError::DeviceUnavailable`] when no local device
    /// can hold the bucket's partition.
    pub async fn get_or_create_reconciler_broker(&self, timestamp: Timestamp) -> Result<Arc<dyn Broker>> {
        let container = self.naming.container_name(timestamp);

        // Held across creation so concurrent feeds of one bucket open it once
        let mut cache = self.cache.lock().await;
        if let Some(target) = cache.as_ref().and_then(|c| c.get(&container)) {
            return Ok(target.broker.clone());
        }

        let account = self.naming.account();
        let partition = self.ring.get_part(account, &container);
        let node = self
            .find_local_handoff_for_part(partition)
            .ok_or_else(|| ReplicationError::DeviceUnavailable {
                container: container.clone(),
                partition,
            })?;

        let location = BrokerLocation::new(node.device.clone(), partition, account, container.clone());
        let broker = initialize_broker(
            self.factory,
            &location,
            BrokerInit {
                put_timestamp: timestamp,
                storage_policy_index: 0,
            },
        )
        .await?;

        if let Some(cache) = cache.as_mut() {
            cache.insert(
                container,
                ReconcilerTarget {
                    partition,
                    broker: broker.clone(),
                    node_id: node.id,
                },
            );
            metrics::set_reconciler_containers(cache.len());
        }
        Ok(broker)
    }

    /// Merge `entries` into the queue container `bucket`.
    ///
    /// Never fails: every error is logged and reported as `false`.
    pub async fn feed_reconciler(&self, bucket: &str, entries: Vec<ObjectRow>) -> bool {
        let count = entries.len();
        let ok = self.try_feed(bucket, entries).await;
        metrics::record_reconciler_feed(bucket, count, ok);
        if ok {
            ReplicationStats::incr(&self.stats.reconciler_feeds_ok);
            ReplicationStats::add(&self.stats.rows_enqueued, count as u64);
        } else {
            ReplicationStats::incr(&self.stats.reconciler_feeds_failed);
        }
        ok
    }

    async fn try_feed(&self, bucket: &str, entries: Vec<ObjectRow>) -> bool {
        let bucket_start: Timestamp = match bucket.parse() {
            Ok(ts) => ts,
            Err(e) => {
                error!(bucket, error = %e, "Invalid reconciler bucket name");
                return false;
            }
        };

        let reconciler = match self.get_or_create_reconciler_broker(bucket_start).await {
            Ok(broker) => broker,
            Err(e @ ReplicationError::DeviceUnavailable { .. }) => {
                warn!(error = %e, "DeviceUnavailable");
                metrics::record_device_unavailable();
                return false;
            }
            Err(e) => {
                error!(bucket, error = %e, "Failed to open reconciler container");
                return false;
            }
        };

        let count = entries.len();
        let db_file = &reconciler.identity().db_file;
        debug!(count, db_file = %db_file, "Adding objects to the reconciler");

        match reconciler.merge_items(entries).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    count,
                    db_file = %db_file,
                    error = %e,
                    "Unhandled error merging items to reconciler container"
                );
                false
            }
        }
    }

    /// Enqueue every misplaced row after `since` and return the highest ROWID
    /// up to which every row was enqueued.
    ///
    /// With nothing to enqueue the broker's max row is returned. Broker read
    /// failures propagate; feed failures only hold the watermark back.
    pub async fn drain_misplaced_rows(&self, broker: &dyn Broker, since: i64) -> Result<i64> {
        let max_sync = broker.get_max_row().await?;
        let mut misplaced = broker.get_misplaced_since(since, self.per_diff).await?;
        if misplaced.is_empty() {
            return Ok(max_sync);
        }

        let translator = RowTranslator::for_broker(broker.identity());
        let mut errors = false;
        let mut low_sync = since;

        while let Some(last) = misplaced.last().map(|row| row.rowid) {
            let mut batches: BTreeMap<String, Vec<ObjectRow>> = BTreeMap::new();
            for row in &misplaced {
                batches
                    .entry(self.naming.container_name(row.created_at))
                    .or_default()
                    .push(translator.translate(row));
            }

            for (bucket, entries) in batches {
                if !self.feed_reconciler(&bucket, entries).await {
                    errors = true;
                }
            }

            if !errors {
                low_sync = last;
            }
            misplaced = broker.get_misplaced_since(last, self.per_diff).await?;
        }

        Ok(low_sync)
    }

    /// Move the reconciler sync point after a broker has been replicated.
    ///
    /// `responses` holds one success flag per peer contacted this pass.
    pub async fn advance_sync_point(
        &self,
        broker: &dyn Broker,
        info: &ReplicationInfo,
        responses: &[bool],
    ) -> Result<SyncPointOutcome> {
        let point = broker.get_reconciler_sync_point().await?;

        if !broker.has_multiple_policies().await? {
            // Nothing can be misplaced; the cursor is bookkeeping only
            if info.max_row > point {
                broker.update_reconciler_sync_point(info.max_row).await?;
                metrics::record_sync_point_advance("fast_forward", info.max_row - point);
                ReplicationStats::incr(&self.stats.sync_point_advances);
                return Ok(SyncPointOutcome::FastForwarded {
                    from: point,
                    to: info.max_row,
                });
            }
            return Ok(SyncPointOutcome::Current);
        }

        let max_sync = self.drain_misplaced_rows(broker, point).await?;
        let successes = responses.iter().filter(|ok| **ok).count();
        let needed = majority_size(responses.len());

        if max_sync <= point {
            metrics::record_sync_point_held("no_progress");
            return Ok(SyncPointOutcome::NoProgress);
        }
        if successes < needed {
            debug!(
                db_file = %broker.identity().db_file,
                successes,
                needed,
                max_sync,
                "Holding reconciler sync point without replication quorum"
            );
            metrics::record_sync_point_held("no_quorum");
            return Ok(SyncPointOutcome::NoQuorum { successes, needed });
        }

        broker.update_reconciler_sync_point(max_sync).await?;
        metrics::record_sync_point_advance("drain", max_sync - point);
        ReplicationStats::incr(&self.stats.sync_point_advances);
        Ok(SyncPointOutcome::Advanced {
            from: point,
            to: max_sync,
        })
    }
}
