// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard range records.
//!
//! A shard range describes a slice of a container's namespace that is being
//! (or has been) split out into a child container. Replicas exchange shard
//! ranges as a JSON array of objects; the `state` field uses its integer code.

use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a shard range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ShardRangeState {
    Found = 10,
    Created = 20,
    Cleaved = 30,
    Active = 40,
    Shrinking = 50,
    Sharding = 60,
    Sharded = 70,
    Shrunk = 80,
}

impl ShardRangeState {
    /// Lowercase name, as used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Created => "created",
            Self::Cleaved => "cleaved",
            Self::Active => "active",
            Self::Shrinking => "shrinking",
            Self::Sharding => "sharding",
            Self::Sharded => "sharded",
            Self::Shrunk => "shrunk",
        }
    }
}

impl std::fmt::Display for ShardRangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ShardRangeState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            10 => Self::Found,
            20 => Self::Created,
            30 => Self::Cleaved,
            40 => Self::Active,
            50 => Self::Shrinking,
            60 => Self::Sharding,
            70 => Self::Sharded,
            80 => Self::Shrunk,
            other => return Err(format!("unknown shard range state {}", other)),
        })
    }
}

impl From<ShardRangeState> for u8 {
    fn from(state: ShardRangeState) -> Self {
        state as u8
    }
}

/// A key range owned by a (possibly future) child container.
///
/// `name` is the `account/container` path of the child and identifies the
/// range across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub name: String,
    pub timestamp: Timestamp,
    /// Exclusive lower bound; empty means unbounded.
    #[serde(default)]
    pub lower: String,
    /// Inclusive upper bound; empty means unbounded.
    #[serde(default)]
    pub upper: String,
    #[serde(default)]
    pub object_count: u64,
    #[serde(default)]
    pub bytes_used: u64,
    pub meta_timestamp: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    pub state: ShardRangeState,
    pub state_timestamp: Timestamp,
    #[serde(default)]
    pub epoch: Option<Timestamp>,
}

impl ShardRange {
    /// New range in the `Found` state, all timestamps set to `timestamp`.
    pub fn new(
        name: impl Into<String>,
        timestamp: Timestamp,
        lower: impl Into<String>,
        upper: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            timestamp,
            lower: lower.into(),
            upper: upper.into(),
            object_count: 0,
            bytes_used: 0,
            meta_timestamp: timestamp,
            deleted: false,
            state: ShardRangeState::Found,
            state_timestamp: timestamp,
            epoch: None,
        }
    }

    /// Builder: set the state.
    pub fn with_state(mut self, state: ShardRangeState) -> Self {
        self.state = state;
        self
    }

    /// Builder: mark as soft-deleted.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Merge `other` into `self`, last writer wins per attribute group.
    ///
    /// Bounds follow `timestamp`, stats follow `meta_timestamp`, and state
    /// follows `state_timestamp`. Returns `true` if anything changed.
    pub fn merge(&mut self, other: &ShardRange) -> bool {
        let mut changed = false;
        if other.timestamp > self.timestamp {
            self.timestamp = other.timestamp;
            self.lower = other.lower.clone();
            self.upper = other.upper.clone();
            self.deleted = other.deleted;
            self.epoch = other.epoch;
            changed = true;
        }
        if other.meta_timestamp > self.meta_timestamp {
            self.meta_timestamp = other.meta_timestamp;
            self.object_count = other.object_count;
            self.bytes_used = other.bytes_used;
            changed = true;
        }
        if other.state_timestamp > self.state_timestamp {
            self.state_timestamp = other.state_timestamp;
            self.state = other.state;
            changed = true;
        }
        changed
    }
}
