// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the container replicator.
//!
//! Errors are split in two layers:
//!
//! - [`BrokerError`]: failures reported by the local replica storage
//!   (the broker adapter). These never leave the process.
//! - [`ReplicationError`]: everything the replicator itself can fail with,
//!   including wrapped broker errors.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `PeerRpc` | Yes | Peer unreachable, non-success status |
//! | `Timeout` | Yes | Peer RPC exceeded the node timeout |
//! | `DeviceUnavailable` | Yes | No local handoff device for a reconciler bucket |
//! | `Broker` | Depends | Local replica storage failure (see [`BrokerError`]) |
//! | `SyncStore` | No | Local SQLite errors (needs operator attention) |
//! | `Serialization` | No | Malformed JSON from a peer |
//! | `InvalidSyncArgs` | No | Malformed positional sync arguments |
//! | `Config` | No | Configuration invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Containment
//!
//! None of these errors are allowed to abort a replication pass. Per-peer
//! errors are contained by the base replicator, per-batch reconciler errors
//! are turned into `false` by the feeder, and fan-out task errors are logged.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Result type alias for broker adapter operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a [`Broker`](crate::broker::Broker) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The database already exists on disk.
    ///
    /// Raised by `initialize()` when two writers race to create the same
    /// replica. Callers treat this as success.
    #[error("database already exists: {0}")]
    AlreadyExists(String),

    /// The database file does not exist.
    #[error("database not found: {0}")]
    NotFound(String),

    /// The database is locked by another writer.
    #[error("database locked: {0}")]
    Locked(String),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// No local device can hold the reconciler container.
    ///
    /// Occurs when neither the primaries nor the handoffs of the bucket's
    /// partition are mounted on this node.
    #[error("No mounted devices found suitable to handoff reconciler container {container} in partition {partition}")]
    DeviceUnavailable { container: String, partition: u32 },

    /// Local replica storage failure.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Peer RPC failure (connection error or non-success status).
    #[error("Peer RPC error ({peer}): {message}")]
    PeerRpc { peer: String, message: String },

    /// Peer RPC exceeded the configured node timeout.
    #[error("Peer RPC to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    /// SQLite error in the container sync store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Sync store error: {0}")]
    SyncStore(#[from] sqlx::Error),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Positional sync arguments could not be parsed.
    #[error("Invalid sync args: {0}")]
    InvalidSyncArgs(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a peer RPC error.
    pub fn peer(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PeerRpc {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PeerRpc { .. } => true,
            Self::Timeout { .. } => true,
            Self::DeviceUnavailable { .. } => true, // device may be remounted
            Self::Broker(e) => e.is_retryable(),
            Self::SyncStore(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidSyncArgs(_) => false,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether this error is the benign "already exists" creation race.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Broker(BrokerError::AlreadyExists(_)))
    }
}
