//! # Container Replicator
//!
//! Anti-entropy replication for container databases, with storage-policy
//! reconciliation and sharding-aware sync.
//!
//! ## Architecture
//!
//! Each node holds local replicas ("brokers") of container databases for a
//! subset of ring partitions. Once per pass the replicator reconciles every
//! local replica with its peer replicas:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          container-replicator                             │
//! │                                                                           │
//! │  ┌────────────────┐  hooks  ┌─────────────────┐   ┌──────────────────┐    │
//! │  │ BaseReplicator │────────►│ ReplicationPass │──►│ ReconcilerFeeder │    │
//! │  │ (row diff,     │         │ (policy fix,    │   │ (misplaced rows  │    │
//! │  │  partitions)   │         │  shard gating)  │   │  → queue dbs)    │    │
//! │  └────────────────┘         └─────────────────┘   └──────────────────┘    │
//! │          │                          │                      │              │
//! │          ▼                          ▼                      ▼              │
//! │  ┌────────────────┐         ┌─────────────────┐   ┌──────────────────┐    │
//! │  │ PeerHandle     │         │ SyncStore       │   │ Reconciler       │    │
//! │  │ (REPLICATE)    │         │ (SQLite)        │   │ fan-out          │    │
//! │  └────────────────┘         └─────────────────┘   └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two problems on top of plain replication
//!
//! 1. **Misplaced rows**: rows written under the wrong storage policy are
//!    copied into time-bucketed queue containers under a reserved account,
//!    and the replica's reconciler cursor only moves past them once the
//!    replica reached a majority of its peers.
//! 2. **Sharding**: while a replica holds shard ranges its object rows are
//!    never pushed to peers; the shard ranges themselves are exchanged on
//!    every pass.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use container_replicator::broker::MemoryBrokerFactory;
//! use container_replicator::ring::StaticRing;
//! use container_replicator::sync_store::NoOpSyncStore;
//! use container_replicator::{BaseReplicator, ContainerReplicator, ReplicatorConfig};
//! use std::sync::Arc;
//!
//! # async fn example(base: Arc<dyn BaseReplicator>) -> container_replicator::Result<()> {
//! let replicator = ContainerReplicator::new(
//!     ReplicatorConfig::default(),
//!     Arc::new(StaticRing::new(10, 3, Vec::new())),
//!     Arc::new(MemoryBrokerFactory::new()),
//!     base,
//!     Arc::new(NoOpSyncStore),
//! )?;
//!
//! let report = replicator.run_once().await?;
//! println!("replicated {} containers", report.success);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod policy;
pub mod quorum;
pub mod reconciler;
pub mod resilience;
pub mod ring;
pub mod rpc;
pub mod shard_range;
pub mod sync_store;
pub mod timestamp;

// Re-exports for convenience
pub use broker::{Broker, BrokerFactory, ReplicationInfo};
pub use config::{ReconcilerConfig, ReplicatorConfig, StoragePolicy, SyncStoreConfig};
pub use coordinator::{ContainerReplicator, PassReport, ReplicationPass, ReplicatorState, StatsSnapshot};
pub use driver::{BaseReplicator, ReplicationDriver, SyncArgs, SyncExchange};
pub use error::{BrokerError, ReplicationError, Result};
pub use peer::{http_client_for, HttpPeer, PeerHandle, PeerResponse};
pub use quorum::majority_size;
pub use rpc::{BaseRpc, ReplicatorRpc, RpcResponse};
pub use sync_store::{SqliteSyncStore, SyncStore};
pub use timestamp::Timestamp;
