// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage policy arbitration.
//!
//! Two replicas of the same container can disagree about its storage policy
//! when the container was deleted and recreated under a different policy
//! while some replicas were unreachable. [`cmp_policy_info`] decides which
//! side is authoritative.

use crate::broker::{Broker, ReplicationInfo};
use crate::error::Result;
use crate::metrics;
use crate::timestamp::Timestamp;
use std::cmp::Ordering;
use tracing::info;

/// The fields policy arbitration looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyState {
    pub put_timestamp: Timestamp,
    pub delete_timestamp: Timestamp,
    pub status_changed_at: Timestamp,
    pub object_count: u64,
    /// `None` when the peer did not send a policy index.
    pub storage_policy_index: Option<i64>,
}

impl PolicyState {
    fn is_deleted(&self) -> bool {
        self.delete_timestamp > self.put_timestamp && self.object_count == 0
    }

    fn is_recreated(&self) -> bool {
        self.put_timestamp > self.delete_timestamp && self.delete_timestamp > Timestamp::ZERO
    }
}

impl From<&ReplicationInfo> for PolicyState {
    fn from(info: &ReplicationInfo) -> Self {
        Self {
            put_timestamp: info.put_timestamp,
            delete_timestamp: info.delete_timestamp,
            status_changed_at: info.status_changed_at,
            object_count: info.object_count,
            storage_policy_index: Some(info.storage_policy_index),
        }
    }
}

/// Order two policy states; `Less` means `local` is the better one,
/// `Greater` means `remote` is.
pub fn cmp_policy_info(local: &PolicyState, remote: &PolicyState) -> Ordering {
    let deleted = local.is_deleted();
    let remote_deleted = remote.is_deleted();
    if deleted || remote_deleted {
        return match (deleted, remote_deleted) {
            (false, _) => Ordering::Less,
            (_, false) => Ordering::Greater,
            // Both deleted: the most recent status change wins
            _ => remote.status_changed_at.cmp(&local.status_changed_at),
        };
    }

    let recreated = local.is_recreated();
    let remote_recreated = remote.is_recreated();
    if recreated || remote_recreated {
        return match (recreated, remote_recreated) {
            (false, _) => Ordering::Greater,
            (_, false) => Ordering::Less,
            _ => remote.status_changed_at.cmp(&local.status_changed_at),
        };
    }

    // Oldest status change is the original policy choice
    local.status_changed_at.cmp(&remote.status_changed_at)
}

/// Whether the local replica holds the wrong policy index and should adopt
/// the remote one.
///
/// Only ever true when the remote sent an index, the index differs, and the
/// remote state is strictly better.
pub fn incorrect_policy_index(local: &PolicyState, remote: &PolicyState) -> bool {
    match remote.storage_policy_index {
        None => false,
        Some(idx) if Some(idx) == local.storage_policy_index => false,
        Some(_) => cmp_policy_info(local, remote) == Ordering::Greater,
    }
}

/// Adopt the remote policy index when the remote state is authoritative.
///
/// The new index is stamped with the current time. `side` labels the
/// correction in metrics. Returns whether a correction was applied.
pub async fn apply_policy_correction(
    broker: &dyn Broker,
    local: &ReplicationInfo,
    remote: &PolicyState,
    side: &str,
) -> Result<bool> {
    let local_state = PolicyState::from(local);
    let index = match remote.storage_policy_index {
        Some(index) if incorrect_policy_index(&local_state, remote) => index,
        _ => return Ok(false),
    };

    broker.set_storage_policy_index(index, Timestamp::now()).await?;
    info!(
        db_file = %broker.identity().db_file,
        from = local.storage_policy_index,
        to = index,
        side,
        "Corrected storage policy index"
    );
    metrics::record_policy_correction(side);
    Ok(true)
}
