//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Scripted BaseReplicator recording driver calls
//! - Mock PeerHandle with per-op replies
//! - Ring, config and broker helpers

#![allow(dead_code)]

pub mod mock_base;
pub mod mock_peer;

pub use mock_base::*;
pub use mock_peer::*;

use container_replicator::broker::{Broker, BrokerIdentity, MemoryBroker, MemoryBrokerFactory, ObjectRow};
use container_replicator::config::{ReplicatorConfig, StoragePolicy};
use container_replicator::coordinator::ContainerReplicator;
use container_replicator::peer::PeerResponse;
use container_replicator::ring::{Node, StaticRing};
use container_replicator::sync_store::{NoOpSyncStore, SyncStore};
use container_replicator::timestamp::Timestamp;
use std::sync::Arc;

/// Ring ids of the devices on the local node.
pub const LOCAL_DEVICES: [u32; 4] = [0, 1, 2, 3];

pub fn node(id: u32) -> Node {
    Node::new(id, format!("10.0.0.{}", id + 1), 6201, format!("sd{}", id))
}

/// Four local devices, three replicas, 256 partitions.
pub fn ring() -> StaticRing {
    StaticRing::new(8, 3, LOCAL_DEVICES.iter().map(|id| node(*id)).collect())
}

pub fn single_policy_config() -> ReplicatorConfig {
    ReplicatorConfig::for_testing("test-node")
}

pub fn multi_policy_config() -> ReplicatorConfig {
    let mut config = ReplicatorConfig::for_testing("test-node");
    config.policies = vec![StoragePolicy::new(0, "gold"), StoragePolicy::new(1, "silver")];
    config
}

/// Existing container database under policy 0.
pub fn container(name: &str, put: i64) -> Arc<MemoryBroker> {
    Arc::new(MemoryBroker::new(
        BrokerIdentity::new("AUTH_test", name, format!("sd0/{}.db", name)),
        Timestamp::from_secs(put),
        0,
    ))
}

/// Insert `(name, created_at secs, policy)` rows in order.
pub async fn add_rows(broker: &MemoryBroker, rows: &[(&str, i64, i64)]) {
    let items = rows
        .iter()
        .map(|(name, secs, policy)| ObjectRow::new(0, *name, Timestamp::from_secs(*secs), *policy))
        .collect();
    broker.merge_items(items).await.unwrap();
}

/// A peer whose replica reports exactly `info` (so it is in sync).
pub async fn in_sync_peer(id: u32, broker: &dyn Broker) -> Arc<MockPeer> {
    let info = broker.get_replication_info().await.unwrap();
    Arc::new(MockPeer::new(node(id)).reply("sync", PeerResponse::json_ok(&info).unwrap()))
}

/// Route replicator logs to the test output; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replicator wired to a scripted base.
pub struct Harness {
    pub factory: Arc<MemoryBrokerFactory>,
    pub base: Arc<ScriptedBase>,
    pub replicator: ContainerReplicator,
}

impl Harness {
    pub fn new(config: ReplicatorConfig, ring: StaticRing) -> Self {
        Self::with_store(config, ring, Arc::new(NoOpSyncStore))
    }

    pub fn with_store(config: ReplicatorConfig, ring: StaticRing, store: Arc<dyn SyncStore>) -> Self {
        init_tracing();
        let factory = Arc::new(MemoryBrokerFactory::new());
        let base = Arc::new(ScriptedBase::new(LOCAL_DEVICES).with_factory(factory.clone()));
        let replicator = ContainerReplicator::new(config, Arc::new(ring), factory.clone(), base.clone(), store)
            .unwrap();
        Self {
            factory,
            base,
            replicator,
        }
    }

    /// Queue containers created so far, by container name.
    pub fn queue_containers(&self) -> Vec<Arc<MemoryBroker>> {
        self.factory.brokers_in_account(".misplaced_objects")
    }
}
