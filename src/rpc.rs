// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Serving side of the replicate verb.
//!
//! [`ReplicatorRpc`] answers the calls a peer's replicator makes against a
//! local replica. It adds the container-specific parts (policy correction on
//! `sync`, shard ranges, sharding-aware abort of bulk transfers) and hands
//! everything else to the generic [`BaseRpc`].
//!
//! | Op | Handled by |
//! |----|------------|
//! | `sync` | [`ReplicatorRpc::handle_sync`], then [`BaseRpc::sync`] |
//! | `get_shard_ranges` | [`ReplicatorRpc::get_shard_ranges`] |
//! | anything else | [`BaseRpc::dispatch`] |

use crate::broker::{Broker, BrokerFactory, ReplicationInfo};
use crate::driver::SyncArgs;
use crate::error::{BrokerError, ReplicationError, Result};
use crate::metrics;
use crate::policy::apply_policy_correction;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Boxed future returned by [`BaseRpc`] calls.
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Answer to one replicate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl RpcResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    /// `200` with `value` as a JSON body.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            status: 200,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body: serde_json::to_vec(value)?,
        })
    }

    /// Status a transport layer should answer with for `error`.
    pub fn from_error(error: &ReplicationError) -> Self {
        let status = match error {
            ReplicationError::InvalidSyncArgs(_) | ReplicationError::Serialization(_) => 400,
            ReplicationError::Broker(BrokerError::NotFound(_)) => 404,
            ReplicationError::Broker(BrokerError::Locked(_)) => 409,
            _ => 500,
        };
        Self::new(status, error.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The generic replicate-verb handler.
pub trait BaseRpc: Send + Sync {
    /// Compare the caller's arguments with `info` and answer the `sync` call.
    fn sync<'a>(
        &'a self,
        broker: &'a Arc<dyn Broker>,
        args: &'a SyncArgs,
        info: &'a ReplicationInfo,
    ) -> RpcFuture<'a, RpcResponse>;

    /// Whether a whole-file transfer into `db_file` should be abandoned in
    /// favour of a row merge from `old_filename`.
    fn abort_rsync_then_merge<'a>(&'a self, db_file: &'a str, old_filename: &'a str) -> RpcFuture<'a, bool>;

    /// Every op this layer does not handle itself.
    fn dispatch<'a>(
        &'a self,
        op: &'a str,
        broker: &'a Arc<dyn Broker>,
        args: &'a [Value],
    ) -> RpcFuture<'a, RpcResponse>;
}

/// Container-aware replicate-verb handler.
pub struct ReplicatorRpc {
    base: Arc<dyn BaseRpc>,
    brokers: Arc<dyn BrokerFactory>,
}

impl ReplicatorRpc {
    pub fn new(base: Arc<dyn BaseRpc>, brokers: Arc<dyn BrokerFactory>) -> Self {
        Self { base, brokers }
    }

    /// Decode the positional `sync` arguments.
    pub fn parse_sync_args(args: &[Value]) -> Result<SyncArgs> {
        SyncArgs::from_args(args)
    }

    /// Local replication info after adopting the caller's policy index when
    /// the caller's state is authoritative.
    pub async fn get_synced_replication_info(&self, broker: &dyn Broker, remote: &SyncArgs) -> Result<ReplicationInfo> {
        let info = broker.get_replication_info().await?;
        if apply_policy_correction(broker, &info, &remote.policy_state(), "rpc").await? {
            return Ok(broker.get_replication_info().await?);
        }
        Ok(info)
    }

    /// Answer `sync`.
    pub async fn handle_sync(&self, broker: &Arc<dyn Broker>, args: &[Value]) -> Result<RpcResponse> {
        let remote = Self::parse_sync_args(args)?;
        let info = self.get_synced_replication_info(broker.as_ref(), &remote).await?;
        self.base.sync(broker, &remote, &info).await
    }

    /// Whether to abandon a whole-file transfer into `db_file`.
    ///
    /// Besides the generic checks, abort when the local database has started
    /// sharding since the transfer began. The database is reopened so the
    /// latest on-disk state is read.
    pub async fn should_abort_bulk_sync(&self, db_file: &str, old_filename: &str) -> Result<bool> {
        if self.base.abort_rsync_then_merge(db_file, old_filename).await? {
            return Ok(true);
        }
        let fresh = self.brokers.open_db_file(db_file)?;
        let abort = fresh.requires_sharding().await? || fresh.is_sharded().await?;
        if abort {
            debug!(db_file = %db_file, "Aborting bulk sync: database is sharding");
        }
        Ok(abort)
    }

    /// Answer `get_shard_ranges` with every range including the own range.
    pub async fn get_shard_ranges(&self, broker: &dyn Broker, include_deleted: bool) -> Result<RpcResponse> {
        let ranges = broker.get_shard_ranges(true, include_deleted).await?;
        RpcResponse::json(&ranges)
    }

    /// Route one replicate call.
    ///
    /// `get_shard_ranges` takes an optional boolean `include_deleted`
    /// argument, defaulting to `true`.
    pub async fn dispatch(&self, op: &str, broker: &Arc<dyn Broker>, args: &[Value]) -> Result<RpcResponse> {
        let result = match op {
            "sync" => self.handle_sync(broker, args).await,
            "get_shard_ranges" => {
                let include_deleted = args.first().and_then(Value::as_bool).unwrap_or(true);
                self.get_shard_ranges(broker.as_ref(), include_deleted).await
            }
            _ => self.base.dispatch(op, broker, args).await,
        };

        match &result {
            Ok(response) => metrics::record_rpc_served(op, response.status),
            Err(e) => {
                warn!(op, db_file = %broker.identity().db_file, error = %e, "Replicate call failed");
                metrics::record_rpc_served(op, RpcResponse::from_error(e).status);
            }
        }
        result
    }
}
