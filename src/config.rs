//! Configuration for the container replicator.
//!
//! Configuration is passed to [`ContainerReplicator::new()`](crate::ContainerReplicator::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use container_replicator::config::{ReplicatorConfig, StoragePolicy};
//!
//! let config = ReplicatorConfig {
//!     node_id: "node-1".into(),
//!     policies: vec![StoragePolicy::new(0, "gold"), StoragePolicy::new(1, "silver")],
//!     ..Default::default()
//! };
//! assert!(config.is_multi_policy());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── node_id: String              # This node's identity (logging only)
//! ├── concurrency: usize           # Bounded fan-out width
//! ├── per_diff: usize              # Misplaced-row page size
//! ├── node_timeout: String         # Peer RPC timeout ("10s")
//! ├── conn_timeout: String         # Peer connect timeout ("500ms")
//! ├── interval_sec: u64            # Delay between passes
//! ├── policies: Vec<StoragePolicy> # Cluster-wide storage policies
//! ├── reconciler: ReconcilerConfig # Reserved account + bucket divisor
//! └── sync_store: SyncStoreConfig  # SQLite container-sync bookkeeping
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "uk.node.london-1"
//! concurrency: 8
//! per_diff: 1000
//! node_timeout: "10s"
//! policies:
//!   - index: 0
//!     name: "gold"
//!   - index: 1
//!     name: "ec-8-4"
//! reconciler:
//!   account: ".misplaced_objects"
//!   container_divisor: 3600
//! sync_store:
//!   sqlite_path: "/var/lib/app/container_sync.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReplicationError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ContainerReplicator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Identity of the local node, used in log lines.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Maximum number of concurrent tasks in the reconciler fan-out.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Page size when draining misplaced rows.
    #[serde(default = "default_per_diff")]
    pub per_diff: usize,

    /// Peer RPC timeout as a duration string (e.g., "10s").
    #[serde(default = "default_node_timeout")]
    pub node_timeout: String,

    /// Peer connect timeout as a duration string (e.g., "500ms").
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout: String,

    /// Seconds between replication passes when run as a daemon.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,

    /// Storage policies configured cluster-wide.
    ///
    /// With more than one policy the sync args carry the policy extension and
    /// brokers may hold misplaced rows.
    #[serde(default = "default_policies")]
    pub policies: Vec<StoragePolicy>,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub sync_store: SyncStoreConfig,
}

fn default_node_id() -> String {
    "local.dev.node.default".to_string()
}

fn default_concurrency() -> usize {
    8
}

fn default_per_diff() -> usize {
    1000
}

fn default_node_timeout() -> String {
    "10s".to_string()
}

fn default_conn_timeout() -> String {
    "500ms".to_string()
}

fn default_interval_sec() -> u64 {
    30
}

fn default_policies() -> Vec<StoragePolicy> {
    vec![StoragePolicy::new(0, "gold")]
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            concurrency: default_concurrency(),
            per_diff: default_per_diff(),
            node_timeout: default_node_timeout(),
            conn_timeout: default_conn_timeout(),
            interval_sec: default_interval_sec(),
            policies: default_policies(),
            reconciler: ReconcilerConfig::default(),
            sync_store: SyncStoreConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            concurrency: 4,
            per_diff: 100,
            sync_store: SyncStoreConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Whether more than one storage policy is configured.
    pub fn is_multi_policy(&self) -> bool {
        self.policies.len() > 1
    }

    /// Parse the node_timeout string to a Duration.
    ///
    /// Falls back to 10s on garbage; [`validate`](Self::validate) rejects it
    /// before the replicator is built.
    pub fn node_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.node_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Parse the conn_timeout string to a Duration.
    pub fn conn_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.conn_timeout).unwrap_or(Duration::from_millis(500))
    }

    /// Get the pass interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    /// Reject configurations the replicator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ReplicationError::Config("concurrency must be > 0".into()));
        }
        if self.per_diff == 0 {
            return Err(ReplicationError::Config("per_diff must be > 0".into()));
        }
        if self.interval_sec == 0 {
            return Err(ReplicationError::Config("interval_sec must be > 0".into()));
        }
        parse_timeout("node_timeout", &self.node_timeout)?;
        parse_timeout("conn_timeout", &self.conn_timeout)?;
        if self.reconciler.container_divisor == 0 {
            return Err(ReplicationError::Config(
                "reconciler.container_divisor must be > 0".into(),
            ));
        }
        if self.reconciler.account.is_empty() {
            return Err(ReplicationError::Config("reconciler.account must be set".into()));
        }
        if self.policies.is_empty() {
            return Err(ReplicationError::Config("at least one storage policy required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.index) {
                return Err(ReplicationError::Config(format!(
                    "duplicate storage policy index {}",
                    policy.index
                )));
            }
        }
        Ok(())
    }
}

fn parse_timeout(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{} {:?} is not a duration: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoragePolicy
// ═══════════════════════════════════════════════════════════════════════════════

/// A storage policy known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub index: i64,
    pub name: String,
}

impl StoragePolicy {
    pub fn new(index: i64, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcilerConfig: queue naming
// ═══════════════════════════════════════════════════════════════════════════════

/// Naming of the reconciler queue containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Reserved account holding the time-bucketed queue containers.
    #[serde(default = "default_reconciler_account")]
    pub account: String,

    /// Bucket width in seconds.
    #[serde(default = "default_container_divisor")]
    pub container_divisor: u64,
}

fn default_reconciler_account() -> String {
    crate::reconciler::MISPLACED_OBJECTS_ACCOUNT.to_string()
}

fn default_container_divisor() -> u64 {
    crate::reconciler::DEFAULT_CONTAINER_DIVISOR
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            account: default_reconciler_account(),
            container_divisor: default_container_divisor(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncStoreConfig: container-sync bookkeeping
// ═══════════════════════════════════════════════════════════════════════════════

/// Container-sync store persistence configuration.
///
/// The store remembers which local containers have a sync target so the
/// cross-region sync daemon can find them without walking every database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStoreConfig {
    /// Path to SQLite database for the sync store.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SyncStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "container_sync.db".to_string(),
            wal_mode: true,
        }
    }
}

impl SyncStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
