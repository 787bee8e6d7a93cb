// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partition-to-node lookup.
//!
//! The replicator only consumes the ring through [`Ring`]. [`StaticRing`] is a
//! small fixed assignment used by tests and single-process deployments; it
//! does not rebalance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A device in the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: u32,
    #[serde(default)]
    pub region: u32,
    #[serde(default)]
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub replication_ip: String,
    pub replication_port: u16,
    pub device: String,
}

impl Node {
    /// Node whose replication address equals its client address.
    pub fn new(id: u32, ip: impl Into<String>, port: u16, device: impl Into<String>) -> Self {
        let ip = ip.into();
        Self {
            id,
            region: 1,
            zone: 1,
            replication_ip: ip.clone(),
            replication_port: port,
            ip,
            port,
            device: device.into(),
        }
    }

    /// `ip:port/device`, as used in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}/{}", self.replication_ip, self.replication_port, self.device)
    }
}

/// Ring lookups used by the replicator.
pub trait Ring: Send + Sync + 'static {
    /// Primary nodes for a partition.
    fn get_part_nodes(&self, partition: u32) -> Vec<Node>;

    /// Handoff nodes for a partition, in preference order.
    fn get_more_nodes(&self, partition: u32) -> Vec<Node>;

    /// Partition holding `account/container`.
    fn get_part(&self, account: &str, container: &str) -> u32;
}

/// Hex digest identifying `/account[/container]`.
pub fn hash_path(account: &str, container: Option<&str>) -> String {
    let path = match container {
        Some(c) => format!("/{}/{}", account, c),
        None => format!("/{}", account),
    };
    hex::encode(Sha256::digest(path.as_bytes()))
}

/// A fixed ring: `replicas` consecutive devices per partition, with optional
/// per-partition overrides.
#[derive(Debug, Clone)]
pub struct StaticRing {
    part_power: u32,
    replicas: usize,
    devices: Vec<Node>,
    overrides: HashMap<u32, (Vec<Node>, Vec<Node>)>,
}

impl StaticRing {
    pub fn new(part_power: u32, replicas: usize, devices: Vec<Node>) -> Self {
        Self {
            part_power: part_power.min(32),
            replicas,
            devices,
            overrides: HashMap::new(),
        }
    }

    /// Pin the primaries and handoffs of one partition.
    pub fn with_assignment(mut self, partition: u32, primaries: Vec<Node>, handoffs: Vec<Node>) -> Self {
        self.overrides.insert(partition, (primaries, handoffs));
        self
    }

    pub fn partition_count(&self) -> u64 {
        1u64 << self.part_power
    }

    fn rotated(&self, partition: u32) -> impl Iterator<Item = &Node> {
        let len = self.devices.len().max(1);
        let start = partition as usize % len;
        self.devices.iter().cycle().skip(start).take(self.devices.len())
    }
}

impl Ring for StaticRing {
    fn get_part_nodes(&self, partition: u32) -> Vec<Node> {
        if let Some((primaries, _)) = self.overrides.get(&partition) {
            return primaries.clone();
        }
        self.rotated(partition).take(self.replicas).cloned().collect()
    }

    fn get_more_nodes(&self, partition: u32) -> Vec<Node> {
        if let Some((_, handoffs)) = self.overrides.get(&partition) {
            return handoffs.clone();
        }
        self.rotated(partition).skip(self.replicas).cloned().collect()
    }

    fn get_part(&self, account: &str, container: &str) -> u32 {
        if self.part_power == 0 {
            return 0;
        }
        let digest = Sha256::digest(format!("/{}/{}", account, container).as_bytes());
        let top = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        top >> (32 - self.part_power)
    }
}
