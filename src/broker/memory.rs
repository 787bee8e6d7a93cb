// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory broker.
//!
//! Keeps a whole container database in a `BTreeMap` keyed by ROWID. Used by
//! the test suites and by embedders that want to run the replicator without
//! a storage engine. Failure flags let tests make individual operations fail.

use super::{
    BoxFuture, Broker, BrokerFactory, BrokerIdentity, BrokerInit, BrokerLocation, DbState,
    ObjectRow, ReplicationInfo,
};
use crate::error::{BrokerError, BrokerResult};
use crate::shard_range::{ShardRange, ShardRangeState};
use crate::timestamp::Timestamp;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    exists: bool,
    created_at: Timestamp,
    put_timestamp: Timestamp,
    delete_timestamp: Timestamp,
    status_changed_at: Timestamp,
    storage_policy_index: i64,
    reconciler_sync_point: i64,
    outgoing_syncs: HashMap<String, i64>,
    metadata: String,
    reported: Reported,
    rows: BTreeMap<i64, ObjectRow>,
    next_rowid: i64,
    shard_ranges: BTreeMap<String, ShardRange>,
    own_shard_range: Option<ShardRange>,
    db_state: Option<DbState>,
    sharding_lock: bool,
    container_sync_to: Option<String>,
}

/// Stats as last reported to the account layer.
#[derive(Debug, Clone, Copy, Default)]
struct Reported {
    put_timestamp: Timestamp,
    delete_timestamp: Timestamp,
    object_count: u64,
    bytes_used: u64,
}

/// Operations a test can make fail.
#[derive(Debug, Default)]
pub struct FailureFlags {
    pub merge_items: AtomicBool,
    pub get_misplaced: AtomicBool,
    pub update_sync_point: AtomicBool,
}

/// A container database held in memory.
#[derive(Debug)]
pub struct MemoryBroker {
    identity: BrokerIdentity,
    state: Mutex<State>,
    /// Failure injection.
    pub fail: FailureFlags,
    misplaced_reads: AtomicUsize,
    merge_items_calls: AtomicUsize,
}

impl MemoryBroker {
    /// A broker handle whose database does not exist yet.
    pub fn unborn(identity: BrokerIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(State {
                reconciler_sync_point: -1,
                next_rowid: 1,
                ..Default::default()
            }),
            fail: FailureFlags::default(),
            misplaced_reads: AtomicUsize::new(0),
            merge_items_calls: AtomicUsize::new(0),
        }
    }

    /// An existing, empty database under `storage_policy_index`.
    pub fn new(identity: BrokerIdentity, put_timestamp: Timestamp, storage_policy_index: i64) -> Self {
        let mut broker = Self::unborn(identity);
        {
            let state = broker.state.get_mut();
            state.exists = true;
            state.created_at = put_timestamp;
            state.put_timestamp = put_timestamp;
            state.status_changed_at = put_timestamp;
            state.storage_policy_index = storage_policy_index;
        }
        broker
    }

    /// Number of `get_misplaced_since` calls so far.
    pub fn misplaced_reads(&self) -> usize {
        self.misplaced_reads.load(Ordering::SeqCst)
    }

    /// Number of `merge_items` calls so far.
    pub fn merge_items_calls(&self) -> usize {
        self.merge_items_calls.load(Ordering::SeqCst)
    }

    /// All rows, ROWID order.
    pub async fn rows(&self) -> Vec<ObjectRow> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn set_db_state(&self, db_state: DbState) {
        self.state.lock().await.db_state = Some(db_state);
    }

    pub async fn set_own_shard_range(&self, range: ShardRange) {
        self.state.lock().await.own_shard_range = Some(range);
    }

    pub async fn set_sharding_lock(&self, locked: bool) {
        self.state.lock().await.sharding_lock = locked;
    }

    pub async fn set_container_sync_to(&self, target: Option<String>) {
        self.state.lock().await.container_sync_to = target;
    }

    /// Mark the container deleted at `timestamp`.
    pub async fn delete_container(&self, timestamp: Timestamp) {
        let mut state = self.state.lock().await;
        state.delete_timestamp = timestamp;
        state.status_changed_at = timestamp;
    }

    /// Record the stats the account layer was last told about.
    pub async fn set_reported(
        &self,
        put_timestamp: Timestamp,
        delete_timestamp: Timestamp,
        object_count: u64,
        bytes_used: u64,
    ) {
        self.state.lock().await.reported = Reported {
            put_timestamp,
            delete_timestamp,
            object_count,
            bytes_used,
        };
    }

    /// Overwrite the sync point without any checks.
    pub async fn force_sync_point(&self, rowid: i64) {
        self.state.lock().await.reconciler_sync_point = rowid;
    }

    fn not_found(&self) -> BrokerError {
        BrokerError::NotFound(self.identity.db_file.clone())
    }

    fn merge_row(state: &mut State, item: ObjectRow) {
        let existing = state
            .rows
            .iter()
            .find(|(_, row)| row.name == item.name && row.storage_policy_index == item.storage_policy_index)
            .map(|(rowid, row)| (*rowid, row.created_at));

        if let Some((rowid, created_at)) = existing {
            if item.created_at <= created_at {
                return;
            }
            state.rows.remove(&rowid);
        }

        let rowid = state.next_rowid;
        state.next_rowid += 1;
        state.rows.insert(rowid, ObjectRow { rowid, ..item });
    }

    fn compute_db_state(state: &State) -> DbState {
        if !state.exists {
            return DbState::NotFound;
        }
        state.db_state.unwrap_or(DbState::Unsharded)
    }
}

impl Broker for MemoryBroker {
    fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    fn exists(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.state.lock().await.exists) })
    }

    fn initialize(&self, init: BrokerInit) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.exists {
                return Err(BrokerError::AlreadyExists(self.identity.db_file.clone()));
            }
            state.exists = true;
            state.created_at = Timestamp::now();
            state.put_timestamp = init.put_timestamp;
            state.status_changed_at = init.put_timestamp;
            state.storage_policy_index = init.storage_policy_index;
            Ok(())
        })
    }

    fn get_replication_info(&self) -> BoxFuture<'_, ReplicationInfo> {
        Box::pin(async move {
            let state = self.state.lock().await;
            if !state.exists {
                return Err(self.not_found());
            }
            let live = state.rows.values().filter(|r| !r.deleted);
            let (object_count, bytes_used) =
                live.fold((0u64, 0u64), |(count, bytes), row| (count + 1, bytes + row.size));

            let mut hasher = Sha256::new();
            for row in state.rows.values() {
                hasher.update(row.name.as_bytes());
                hasher.update(row.created_at.internal().as_bytes());
                hasher.update([row.deleted as u8]);
            }

            Ok(ReplicationInfo {
                account: self.identity.account.clone(),
                container: self.identity.container.clone(),
                created_at: state.created_at,
                put_timestamp: state.put_timestamp,
                delete_timestamp: state.delete_timestamp,
                status_changed_at: state.status_changed_at,
                object_count,
                bytes_used,
                hash: hex::encode(hasher.finalize()),
                id: crate::ring::hash_path(&self.identity.db_file, None)[..32].to_string(),
                max_row: state.rows.keys().next_back().copied().unwrap_or(-1),
                reconciler_sync_point: state.reconciler_sync_point,
                storage_policy_index: state.storage_policy_index,
                metadata: state.metadata.clone(),
                reported_put_timestamp: state.reported.put_timestamp,
                reported_delete_timestamp: state.reported.delete_timestamp,
                reported_object_count: state.reported.object_count,
                reported_bytes_used: state.reported.bytes_used,
            })
        })
    }

    fn merge_timestamps(
        &self,
        created_at: Timestamp,
        put_timestamp: Timestamp,
        delete_timestamp: Timestamp,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.exists {
                return Err(self.not_found());
            }
            let was_deleted = state.delete_timestamp > state.put_timestamp;
            state.created_at = state.created_at.min(created_at);
            state.put_timestamp = state.put_timestamp.max(put_timestamp);
            state.delete_timestamp = state.delete_timestamp.max(delete_timestamp);
            let now_deleted = state.delete_timestamp > state.put_timestamp;
            if was_deleted != now_deleted {
                state.status_changed_at = state.put_timestamp.max(state.delete_timestamp);
            }
            Ok(())
        })
    }

    fn set_storage_policy_index(&self, index: i64, timestamp: Timestamp) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.exists {
                return Err(self.not_found());
            }
            if state.storage_policy_index != index {
                state.storage_policy_index = index;
                state.status_changed_at = timestamp;
            }
            Ok(())
        })
    }

    fn get_shard_ranges(&self, include_own: bool, include_deleted: bool) -> BoxFuture<'_, Vec<ShardRange>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut ranges: Vec<ShardRange> = state
                .shard_ranges
                .values()
                .filter(|r| include_deleted || !r.deleted)
                .cloned()
                .collect();
            if include_own {
                if let Some(own) = &state.own_shard_range {
                    if include_deleted || !own.deleted {
                        ranges.push(own.clone());
                    }
                }
            }
            Ok(ranges)
        })
    }

    fn merge_shard_ranges(&self, ranges: Vec<ShardRange>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.exists {
                return Err(self.not_found());
            }
            let own_name = format!("{}/{}", self.identity.account, self.identity.container);
            for range in ranges {
                if range.name == own_name {
                    match state.own_shard_range.as_mut() {
                        Some(own) => {
                            own.merge(&range);
                        }
                        None => state.own_shard_range = Some(range),
                    }
                    continue;
                }
                match state.shard_ranges.get_mut(&range.name) {
                    Some(existing) => {
                        existing.merge(&range);
                    }
                    None => {
                        state.shard_ranges.insert(range.name.clone(), range);
                    }
                }
            }
            Ok(())
        })
    }

    fn get_other_replication_items(&self) -> BoxFuture<'_, Vec<ShardRange>> {
        self.get_shard_ranges(true, true)
    }

    fn get_max_row(&self) -> BoxFuture<'_, i64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.rows.keys().next_back().copied().unwrap_or(-1))
        })
    }

    fn get_misplaced_since(&self, rowid: i64, limit: usize) -> BoxFuture<'_, Vec<ObjectRow>> {
        Box::pin(async move {
            self.misplaced_reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.get_misplaced.load(Ordering::SeqCst) {
                return Err(BrokerError::Storage("injected get_misplaced_since failure".into()));
            }
            let state = self.state.lock().await;
            let policy = state.storage_policy_index;
            Ok(state
                .rows
                .range(rowid.saturating_add(1)..)
                .map(|(_, row)| row)
                .filter(|row| row.storage_policy_index != policy)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn merge_items(&self, items: Vec<ObjectRow>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.merge_items_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.merge_items.load(Ordering::SeqCst) {
                return Err(BrokerError::Storage("injected merge_items failure".into()));
            }
            let mut state = self.state.lock().await;
            if !state.exists {
                return Err(self.not_found());
            }
            for item in items {
                Self::merge_row(&mut state, item);
            }
            Ok(())
        })
    }

    fn get_reconciler_sync_point(&self) -> BoxFuture<'_, i64> {
        Box::pin(async move { Ok(self.state.lock().await.reconciler_sync_point) })
    }

    fn update_reconciler_sync_point(&self, rowid: i64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail.update_sync_point.load(Ordering::SeqCst) {
                return Err(BrokerError::Locked(self.identity.db_file.clone()));
            }
            self.state.lock().await.reconciler_sync_point = rowid;
            Ok(())
        })
    }

    fn get_sync<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.outgoing_syncs.get(remote_id).copied().unwrap_or(-1))
        })
    }

    fn merge_syncs<'a>(&'a self, remote_id: &'a str, sync_point: i64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let point = state.outgoing_syncs.entry(remote_id.to_string()).or_insert(-1);
            *point = (*point).max(sync_point);
            Ok(())
        })
    }

    fn has_multiple_policies(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let policy = state.storage_policy_index;
            Ok(state.rows.values().any(|row| row.storage_policy_index != policy))
        })
    }

    fn requires_sharding(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let db_state = Self::compute_db_state(&state);
            let own_state = state.own_shard_range.as_ref().map(|r| r.state);
            Ok(matches!(db_state, DbState::Unsharded | DbState::Sharding)
                && matches!(
                    own_state,
                    Some(ShardRangeState::Sharding)
                        | Some(ShardRangeState::Shrinking)
                        | Some(ShardRangeState::Sharded)
                        | Some(ShardRangeState::Shrunk)
                ))
        })
    }

    fn is_sharded(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(Self::compute_db_state(&state) == DbState::Sharded)
        })
    }

    fn has_sharding_lock(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.state.lock().await.sharding_lock) })
    }

    fn db_state(&self) -> BoxFuture<'_, DbState> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(Self::compute_db_state(&state))
        })
    }

    fn is_deleted(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let state = self.state.lock().await;
            if !state.exists {
                return Ok(true);
            }
            let live = state.rows.values().any(|r| !r.deleted);
            Ok(state.delete_timestamp > state.put_timestamp && !live)
        })
    }

    fn container_sync_to(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.container_sync_to.clone()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry of [`MemoryBroker`]s keyed by database path.
#[derive(Debug, Default)]
pub struct MemoryBrokerFactory {
    brokers: StdMutex<HashMap<String, Arc<MemoryBroker>>>,
}

impl MemoryBrokerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<MemoryBroker>>> {
        self.brokers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an existing broker under its database path.
    pub fn insert(&self, broker: Arc<MemoryBroker>) {
        self.registry().insert(broker.identity().db_file.clone(), broker);
    }

    /// Open (creating the handle if needed) and return the concrete type.
    pub fn open_memory(&self, location: &BrokerLocation) -> Arc<MemoryBroker> {
        let db_file = location.db_path();
        let mut registry = self.registry();
        registry
            .entry(db_file.clone())
            .or_insert_with(|| {
                let mut identity =
                    BrokerIdentity::new(location.account.clone(), location.container.clone(), db_file);
                identity.epoch = location.epoch;
                Arc::new(MemoryBroker::unborn(identity))
            })
            .clone()
    }

    /// Look up a registered broker.
    pub fn get(&self, db_file: &str) -> Option<Arc<MemoryBroker>> {
        self.registry().get(db_file).cloned()
    }

    /// Drop a broker from the registry, as deleting its file would.
    pub fn remove(&self, db_file: &str) -> bool {
        self.registry().remove(db_file).is_some()
    }

    /// Brokers under `account`.
    pub fn brokers_in_account(&self, account: &str) -> Vec<Arc<MemoryBroker>> {
        let mut brokers: Vec<_> = self
            .registry()
            .values()
            .filter(|b| b.identity().account == account)
            .cloned()
            .collect();
        brokers.sort_by(|a, b| a.identity().container.cmp(&b.identity().container));
        brokers
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }
}

impl BrokerFactory for MemoryBrokerFactory {
    fn open(&self, location: &BrokerLocation) -> Arc<dyn Broker> {
        self.open_memory(location)
    }

    fn open_db_file(&self, db_file: &str) -> BrokerResult<Arc<dyn Broker>> {
        match self.get(db_file) {
            Some(broker) => Ok(broker),
            None => Err(BrokerError::NotFound(db_file.to_string())),
        }
    }
}
