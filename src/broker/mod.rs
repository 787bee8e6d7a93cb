// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker adapter traits.
//!
//! A broker is the local handle to one partition's replica of a container
//! database. The replicator never touches storage directly; everything goes
//! through [`Broker`], which lets the storage engine live elsewhere and lets
//! tests run against [`MemoryBroker`].
//!
//! # Example
//!
//! ```rust,no_run
//! use container_replicator::broker::{Broker, BrokerFactory, BrokerLocation, MemoryBrokerFactory};
//!
//! # async fn example() -> Result<(), container_replicator::error::BrokerError> {
//! let factory = MemoryBrokerFactory::new();
//! let broker = factory.open(&BrokerLocation::new("sda", 7, "AUTH_test", "photos"));
//! let info = broker.get_replication_info().await?;
//! assert_eq!(info.max_row, -1);
//! # Ok(())
//! # }
//! ```

pub mod memory;

pub use memory::{MemoryBroker, MemoryBrokerFactory};

use crate::error::BrokerResult;
use crate::shard_range::ShardRange;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async broker futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = BrokerResult<T>> + Send + 'a>>;

/// Content type of a reconciler queue entry for an object PUT.
pub const QUEUE_CONTENT_TYPE_PUT: &str = "application/x-put";
/// Content type of a reconciler queue entry for an object DELETE.
pub const QUEUE_CONTENT_TYPE_DELETE: &str = "application/x-delete";

// ═══════════════════════════════════════════════════════════════════════════════
// Data model
// ═══════════════════════════════════════════════════════════════════════════════

/// Who a broker is and where its database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerIdentity {
    pub account: String,
    pub container: String,
    /// Account of the root container (differs from `account` for shards).
    pub root_account: String,
    /// Name of the root container (differs from `container` for shards).
    pub root_container: String,
    pub epoch: Option<Timestamp>,
    pub db_file: String,
}

impl BrokerIdentity {
    /// Identity for an unsharded container, rooted at itself.
    pub fn new(account: impl Into<String>, container: impl Into<String>, db_file: impl Into<String>) -> Self {
        let account = account.into();
        let container = container.into();
        Self {
            root_account: account.clone(),
            root_container: container.clone(),
            account,
            container,
            epoch: None,
            db_file: db_file.into(),
        }
    }
}

/// Where to open a broker: device, partition and container path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerLocation {
    pub device: String,
    pub partition: u32,
    pub account: String,
    pub container: String,
    pub epoch: Option<Timestamp>,
}

impl BrokerLocation {
    pub fn new(
        device: impl Into<String>,
        partition: u32,
        account: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            partition,
            account: account.into(),
            container: container.into(),
            epoch: None,
        }
    }

    /// Relative database path: `{device}/containers/{part}/{suffix}/{hash}/{hash}[_{epoch}].db`.
    pub fn db_path(&self) -> String {
        let hash = crate::ring::hash_path(&self.account, Some(&self.container));
        let suffix = &hash[hash.len() - 3..];
        match self.epoch {
            Some(epoch) => format!(
                "{}/containers/{}/{}/{}/{}_{}.db",
                self.device,
                self.partition,
                suffix,
                hash,
                hash,
                epoch.internal()
            ),
            None => format!(
                "{}/containers/{}/{}/{}/{}.db",
                self.device, self.partition, suffix, hash, hash
            ),
        }
    }
}

/// Arguments for creating a new broker database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerInit {
    pub put_timestamp: Timestamp,
    pub storage_policy_index: i64,
}

/// Sharding lifecycle of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbState {
    NotFound,
    Unsharded,
    Sharding,
    Sharded,
    Collapsed,
}

impl DbState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unsharded => "unsharded",
            Self::Sharding => "sharding",
            Self::Sharded => "sharded",
            Self::Collapsed => "collapsed",
        }
    }
}

impl std::fmt::Display for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a broker's sync-relevant fields.
///
/// Produced locally and received from peers; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub account: String,
    pub container: String,
    pub created_at: Timestamp,
    pub put_timestamp: Timestamp,
    pub delete_timestamp: Timestamp,
    pub status_changed_at: Timestamp,
    #[serde(rename = "count")]
    pub object_count: u64,
    pub bytes_used: u64,
    pub hash: String,
    pub id: String,
    pub max_row: i64,
    pub reconciler_sync_point: i64,
    pub storage_policy_index: i64,
    #[serde(default)]
    pub metadata: String,
    /// Stats last sent to the account layer; lag behind the live values
    /// until the next update.
    #[serde(default)]
    pub reported_put_timestamp: Timestamp,
    #[serde(default)]
    pub reported_delete_timestamp: Timestamp,
    #[serde(default)]
    pub reported_object_count: u64,
    #[serde(default)]
    pub reported_bytes_used: u64,
}

/// One object row.
///
/// `rowid` orders rows within a single database; misplaced rows are paged by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRow {
    #[serde(rename = "ROWID", default)]
    pub rowid: i64,
    pub name: String,
    pub created_at: Timestamp,
    pub size: u64,
    pub content_type: String,
    pub etag: String,
    pub deleted: bool,
    pub storage_policy_index: i64,
    pub ctype_timestamp: Timestamp,
    pub meta_timestamp: Timestamp,
}

impl ObjectRow {
    /// A live object row with all timestamps set to `created_at`.
    pub fn new(rowid: i64, name: impl Into<String>, created_at: Timestamp, storage_policy_index: i64) -> Self {
        Self {
            rowid,
            name: name.into(),
            created_at,
            size: 0,
            content_type: "application/octet-stream".to_string(),
            etag: String::new(),
            deleted: false,
            storage_policy_index,
            ctype_timestamp: created_at,
            meta_timestamp: created_at,
        }
    }

    /// Builder: mark as a tombstone.
    pub fn tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Local handle to one partition's replica of a container database.
///
/// Writers to a single physical replica are serialized by the implementation.
pub trait Broker: Send + Sync + 'static {
    /// Identity and database path.
    fn identity(&self) -> &BrokerIdentity;

    /// Whether the database exists on disk.
    fn exists(&self) -> BoxFuture<'_, bool>;

    /// Create the database.
    ///
    /// Fails with [`BrokerError::AlreadyExists`](crate::error::BrokerError::AlreadyExists)
    /// if another writer created it first.
    fn initialize(&self, init: BrokerInit) -> BoxFuture<'_, ()>;

    fn get_replication_info(&self) -> BoxFuture<'_, ReplicationInfo>;

    /// Merge remote created/put/delete timestamps, keeping the maximum of each.
    fn merge_timestamps(
        &self,
        created_at: Timestamp,
        put_timestamp: Timestamp,
        delete_timestamp: Timestamp,
    ) -> BoxFuture<'_, ()>;

    fn set_storage_policy_index(&self, index: i64, timestamp: Timestamp) -> BoxFuture<'_, ()>;

    /// Shard ranges held by this broker.
    ///
    /// `include_own` adds the broker's own range, `include_deleted` adds
    /// soft-deleted ranges.
    fn get_shard_ranges(&self, include_own: bool, include_deleted: bool) -> BoxFuture<'_, Vec<ShardRange>>;

    /// Merge shard ranges, last writer wins per range.
    fn merge_shard_ranges(&self, ranges: Vec<ShardRange>) -> BoxFuture<'_, ()>;

    /// Non-object items replicated alongside rows (the shard ranges).
    fn get_other_replication_items(&self) -> BoxFuture<'_, Vec<ShardRange>>;

    /// Highest ROWID in the object table, `-1` when empty.
    fn get_max_row(&self) -> BoxFuture<'_, i64>;

    /// Up to `limit` rows whose policy differs from the container's, with ROWID > `rowid`.
    fn get_misplaced_since(&self, rowid: i64, limit: usize) -> BoxFuture<'_, Vec<ObjectRow>>;

    fn merge_items(&self, items: Vec<ObjectRow>) -> BoxFuture<'_, ()>;

    fn get_reconciler_sync_point(&self) -> BoxFuture<'_, i64>;

    fn update_reconciler_sync_point(&self, rowid: i64) -> BoxFuture<'_, ()>;

    /// Highest ROWID already pushed to the replica `remote_id`, `-1` when
    /// nothing was ever pushed there.
    fn get_sync<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, i64>;

    /// Record that rows up to `sync_point` reached `remote_id`. Never moves
    /// a sync point backwards.
    fn merge_syncs<'a>(&'a self, remote_id: &'a str, sync_point: i64) -> BoxFuture<'a, ()>;

    fn has_multiple_policies(&self) -> BoxFuture<'_, bool>;

    /// Has shard ranges to cleave but has not finished sharding.
    fn requires_sharding(&self) -> BoxFuture<'_, bool>;

    fn is_sharded(&self) -> BoxFuture<'_, bool>;

    fn has_sharding_lock(&self) -> BoxFuture<'_, bool>;

    fn db_state(&self) -> BoxFuture<'_, DbState>;

    fn is_deleted(&self) -> BoxFuture<'_, bool>;

    /// Container-sync target, if one is configured.
    fn container_sync_to(&self) -> BoxFuture<'_, Option<String>>;
}

/// Opens brokers by location or by database file.
pub trait BrokerFactory: Send + Sync + 'static {
    /// Open (without creating) the broker at `location`.
    fn open(&self, location: &BrokerLocation) -> Arc<dyn Broker>;

    /// Open a fresh handle onto an existing database file.
    ///
    /// Callers use this to read the latest on-disk state rather than a cached
    /// handle.
    fn open_db_file(&self, db_file: &str) -> BrokerResult<Arc<dyn Broker>>;
}
