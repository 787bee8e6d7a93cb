// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard-range exchange with peers.
//!
//! Shard ranges are small and few compared to object rows, so the whole set
//! is exchanged on every pass in both directions: pulled with
//! `get_shard_ranges` after every successful sync response, and pushed with
//! `merge_items` before any object replication is considered.
//!
//! None of these functions fail: a peer that cannot be reached simply gets
//! the ranges on the next pass.

use crate::broker::Broker;
use crate::metrics;
use crate::peer::PeerHandle;
use crate::shard_range::ShardRange;
use serde_json::Value;
use tracing::{debug, warn};

/// Pull the peer's shard ranges and merge them locally.
///
/// Returns whether anything was merged.
pub async fn fetch_and_merge_shard_ranges(peer: &dyn PeerHandle, broker: &dyn Broker) -> bool {
    let db_file = &broker.identity().db_file;
    let address = peer.node().address();

    let response = match peer.replicate("get_shard_ranges", Vec::new()).await {
        Ok(response) => response,
        Err(e) => {
            debug!(db_file = %db_file, peer = %address, error = %e, "Shard range fetch failed");
            metrics::record_shard_range_fetch(false, 0);
            return false;
        }
    };
    if !response.is_success() {
        debug!(db_file = %db_file, peer = %address, status = response.status, "Shard range fetch refused");
        metrics::record_shard_range_fetch(false, 0);
        return false;
    }

    let ranges: Vec<ShardRange> = match response.json() {
        Ok(ranges) => ranges,
        Err(e) => {
            warn!(db_file = %db_file, peer = %address, error = %e, "Undecodable shard ranges from peer");
            metrics::record_shard_range_fetch(false, 0);
            return false;
        }
    };

    let count = ranges.len();
    if let Err(e) = broker.merge_shard_ranges(ranges).await {
        warn!(db_file = %db_file, peer = %address, error = %e, "Failed to merge peer shard ranges");
        metrics::record_shard_range_fetch(false, count);
        return false;
    }
    metrics::record_shard_range_fetch(true, count);
    true
}

/// Push every shard range the broker holds, own and deleted included.
///
/// Nothing to push counts as success.
pub async fn sync_other_items(broker: &dyn Broker, peer: &dyn PeerHandle, local_id: &str) -> bool {
    let db_file = &broker.identity().db_file;
    let address = peer.node().address();

    let items = match broker.get_other_replication_items().await {
        Ok(items) => items,
        Err(e) => {
            warn!(db_file = %db_file, error = %e, "Failed to read shard ranges for push");
            return false;
        }
    };
    if items.is_empty() {
        return true;
    }

    let count = items.len();
    let payload = match serde_json::to_value(&items) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(db_file = %db_file, error = %e, "Failed to encode shard ranges");
            return false;
        }
    };

    let ok = match peer
        .replicate("merge_items", vec![payload, Value::from(local_id)])
        .await
    {
        Ok(response) => response.is_success(),
        Err(e) => {
            debug!(db_file = %db_file, peer = %address, error = %e, "Shard range push failed");
            false
        }
    };
    metrics::record_shard_range_push(ok, count);
    if ok {
        debug!(db_file = %db_file, count, peer = %address, "Synced other items");
    }
    ok
}
