// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciler queue naming and entry translation.
//!
//! Rows written under the wrong storage policy are copied into queue
//! containers under a reserved account. Each queue container covers one
//! time bucket of `container_divisor` seconds and is named by the bucket's
//! start second, so any replica enqueueing a row created at time `t` picks
//! the same container.
//!
//! ```text
//! row created_at 1700001234.5  ──►  .misplaced_objects/1699999200
//!     name "photo.jpg", policy 1    entry "1:/AUTH_test/photos/photo.jpg"
//! ```

pub mod feeder;

pub use feeder::{initialize_broker, ReconcilerFeeder, SyncPointOutcome};

use crate::broker::{
    Broker, BrokerIdentity, ObjectRow, QUEUE_CONTENT_TYPE_DELETE, QUEUE_CONTENT_TYPE_PUT,
};
use crate::config::ReconcilerConfig;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Reserved account holding the reconciler queue containers.
pub const MISPLACED_OBJECTS_ACCOUNT: &str = ".misplaced_objects";

/// Default queue container bucket width, in seconds.
pub const DEFAULT_CONTAINER_DIVISOR: u64 = 3600;

/// A reconciler queue replica created or opened during the current pass.
#[derive(Clone)]
pub struct ReconcilerTarget {
    pub partition: u32,
    pub broker: Arc<dyn Broker>,
    /// Ring id of the local device holding the replica.
    pub node_id: u32,
}

impl std::fmt::Debug for ReconcilerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerTarget")
            .field("partition", &self.partition)
            .field("db_file", &self.broker.identity().db_file)
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Per-pass cache of reconciler replicas keyed by bucket name.
///
/// `None` means the cache is disabled: replicas are still created but not
/// remembered.
pub type ReconcilerCache = Mutex<Option<HashMap<String, ReconcilerTarget>>>;

/// Queue container naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerNaming {
    account: String,
    divisor: u64,
}

impl Default for ReconcilerNaming {
    fn default() -> Self {
        Self::new(MISPLACED_OBJECTS_ACCOUNT, DEFAULT_CONTAINER_DIVISOR)
    }
}

impl ReconcilerNaming {
    pub fn new(account: impl Into<String>, divisor: u64) -> Self {
        Self {
            account: account.into(),
            divisor: divisor.max(1),
        }
    }

    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self::new(config.account.clone(), config.container_divisor)
    }

    /// The reserved account.
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn divisor(&self) -> u64 {
        self.divisor
    }

    /// Whether `account` is the reserved reconciler account.
    pub fn is_reserved(&self, account: &str) -> bool {
        account == self.account
    }

    /// Start second of the bucket holding `timestamp`.
    pub fn bucket_start(&self, timestamp: Timestamp) -> i64 {
        let secs = timestamp.as_secs();
        let divisor = self.divisor as i64;
        secs.div_euclid(divisor) * divisor
    }

    /// Queue container name for a row created at `timestamp`.
    pub fn container_name(&self, timestamp: Timestamp) -> String {
        self.bucket_start(timestamp).to_string()
    }

    /// Queue object name: `{policy}:/{account}/{container}/{object}`.
    pub fn queue_object_name(policy_index: i64, account: &str, container: &str, object: &str) -> String {
        format!("{}:/{}/{}/{}", policy_index, account, container, object)
    }
}

/// Turns misplaced rows of one container into queue entries.
///
/// Entries name the root container so rows from shards land under the
/// container clients see.
#[derive(Debug, Clone)]
pub struct RowTranslator {
    root_account: String,
    root_container: String,
}

impl RowTranslator {
    pub fn for_broker(identity: &BrokerIdentity) -> Self {
        Self {
            root_account: identity.root_account.clone(),
            root_container: identity.root_container.clone(),
        }
    }

    pub fn translate(&self, row: &ObjectRow) -> ObjectRow {
        let content_type = if row.deleted {
            QUEUE_CONTENT_TYPE_DELETE
        } else {
            QUEUE_CONTENT_TYPE_PUT
        };
        ObjectRow {
            rowid: 0,
            name: ReconcilerNaming::queue_object_name(
                row.storage_policy_index,
                &self.root_account,
                &self.root_container,
                &row.name,
            ),
            created_at: row.created_at,
            size: 0,
            content_type: content_type.to_string(),
            etag: row.created_at.internal(),
            deleted: false,
            storage_policy_index: 0,
            ctype_timestamp: row.created_at,
            meta_timestamp: row.created_at,
        }
    }
}
