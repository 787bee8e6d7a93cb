// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The seam between the generic row-diff replicator and the container logic.
//!
//! The generic replicator ([`BaseReplicator`]) owns the per-partition loop,
//! peer selection, row diffing and bulk transfer. At fixed points of that
//! loop it calls back into a [`ReplicationDriver`]; every hook has a default
//! that forwards to the base, so a driver only overrides what it changes.
//!
//! ```text
//!  BaseReplicator::run_pass(driver)
//!    for each local broker:
//!      for each peer:
//!        driver.gather_sync_args ──► peer "sync" ──► driver.handle_sync_response
//!                                                      ├─ driver.in_sync
//!                                                      └─ driver.choose_replication_mode
//!      driver.post_replicate_hook
//!      driver.cleanup_after_replicate ──► driver.delete_broker
//!      deleted and empty: driver.report_up_to_date ──► driver.delete_broker
//! ```
//!
//! Base methods that need to re-enter the driver take it as `&dyn
//! ReplicationDriver`, so the override, not the base, is what runs.
//!
//! # Wire format
//!
//! The `sync` call carries positional arguments:
//!
//! | Index | Field |
//! |-------|-------|
//! | 0 | `max_row` |
//! | 1 | `hash` |
//! | 2 | `id` |
//! | 3 | `created_at` |
//! | 4 | `put_timestamp` |
//! | 5 | `delete_timestamp` |
//! | 6 | `metadata` |
//! | 7 | `status_changed_at` (policy extension) |
//! | 8 | `count` (policy extension) |
//! | 9 | `storage_policy_index` (policy extension) |

use crate::broker::{Broker, ReplicationInfo};
use crate::coordinator::PassReport;
use crate::error::{ReplicationError, Result};
use crate::peer::{PeerHandle, PeerResponse};
use crate::policy::PolicyState;
use crate::timestamp::Timestamp;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by replication hooks.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Number of positional sync arguments without the policy extension.
pub const BASE_SYNC_ARGS: usize = 7;

// ═══════════════════════════════════════════════════════════════════════════════
// Sync arguments
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy fields appended to the sync arguments in multi-policy clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyArgs {
    pub status_changed_at: Timestamp,
    pub count: u64,
    pub storage_policy_index: i64,
}

/// Arguments of the `sync` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncArgs {
    pub max_row: i64,
    pub hash: String,
    pub id: String,
    pub created_at: Timestamp,
    pub put_timestamp: Timestamp,
    pub delete_timestamp: Timestamp,
    pub metadata: String,
    pub policy: Option<PolicyArgs>,
}

impl SyncArgs {
    /// Base arguments for `info`, without the policy extension.
    pub fn from_info(info: &ReplicationInfo) -> Self {
        Self {
            max_row: info.max_row,
            hash: info.hash.clone(),
            id: info.id.clone(),
            created_at: info.created_at,
            put_timestamp: info.put_timestamp,
            delete_timestamp: info.delete_timestamp,
            metadata: info.metadata.clone(),
            policy: None,
        }
    }

    /// Builder: append the policy extension taken from `info`.
    pub fn with_policy(mut self, info: &ReplicationInfo) -> Self {
        self.policy = Some(PolicyArgs {
            status_changed_at: info.status_changed_at,
            count: info.object_count,
            storage_policy_index: info.storage_policy_index,
        });
        self
    }

    /// Positional JSON form.
    pub fn to_args(&self) -> Vec<Value> {
        let mut args = vec![
            Value::from(self.max_row),
            Value::from(self.hash.clone()),
            Value::from(self.id.clone()),
            Value::from(self.created_at.internal()),
            Value::from(self.put_timestamp.internal()),
            Value::from(self.delete_timestamp.internal()),
            Value::from(self.metadata.clone()),
        ];
        if let Some(policy) = &self.policy {
            args.push(Value::from(policy.status_changed_at.internal()));
            args.push(Value::from(policy.count));
            args.push(Value::from(policy.storage_policy_index));
        }
        args
    }

    /// Parse the positional JSON form.
    ///
    /// The policy extension is read only when more than nine arguments are
    /// present; anything in between is ignored.
    pub fn from_args(args: &[Value]) -> Result<Self> {
        if args.len() < BASE_SYNC_ARGS {
            return Err(ReplicationError::InvalidSyncArgs(format!(
                "expected at least {} arguments, got {}",
                BASE_SYNC_ARGS,
                args.len()
            )));
        }

        let policy = if args.len() > 9 {
            Some(PolicyArgs {
                status_changed_at: arg_timestamp(args, 7)?,
                count: arg_u64(args, 8)?,
                storage_policy_index: arg_i64(args, 9)?,
            })
        } else {
            None
        };

        Ok(Self {
            max_row: arg_i64(args, 0)?,
            hash: arg_string(args, 1)?,
            id: arg_string(args, 2)?,
            created_at: arg_timestamp(args, 3)?,
            put_timestamp: arg_timestamp(args, 4)?,
            delete_timestamp: arg_timestamp(args, 5)?,
            metadata: arg_string(args, 6)?,
            policy,
        })
    }

    /// The sender's policy state as far as these arguments describe it.
    ///
    /// Without the extension the index is unknown, which never triggers a
    /// correction.
    pub fn policy_state(&self) -> PolicyState {
        match &self.policy {
            Some(policy) => PolicyState {
                put_timestamp: self.put_timestamp,
                delete_timestamp: self.delete_timestamp,
                status_changed_at: policy.status_changed_at,
                object_count: policy.count,
                storage_policy_index: Some(policy.storage_policy_index),
            },
            None => PolicyState {
                put_timestamp: self.put_timestamp,
                delete_timestamp: self.delete_timestamp,
                status_changed_at: self.put_timestamp.max(self.delete_timestamp),
                object_count: 0,
                storage_policy_index: None,
            },
        }
    }
}

fn invalid(index: usize, what: &str, value: &Value) -> ReplicationError {
    ReplicationError::InvalidSyncArgs(format!("argument {} is not {}: {}", index, what, value))
}

fn arg_string(args: &[Value], index: usize) -> Result<String> {
    match &args[index] {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(invalid(index, "a string", other)),
    }
}

fn arg_i64(args: &[Value], index: usize) -> Result<i64> {
    let value = &args[index];
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(index, "an integer", value))
}

fn arg_u64(args: &[Value], index: usize) -> Result<u64> {
    let value = &args[index];
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(index, "a count", value))
}

fn arg_timestamp(args: &[Value], index: usize) -> Result<Timestamp> {
    let value = &args[index];
    let parsed = match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(index, "a timestamp", value))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hooks
// ═══════════════════════════════════════════════════════════════════════════════

/// One broker/peer exchange in progress.
pub struct SyncExchange<'a> {
    pub broker: &'a Arc<dyn Broker>,
    pub peer: &'a dyn PeerHandle,
    /// Local replication info taken when the exchange started.
    pub local_info: &'a ReplicationInfo,
    pub different_region: bool,
}

impl<'a> SyncExchange<'a> {
    pub fn new(broker: &'a Arc<dyn Broker>, peer: &'a dyn PeerHandle, local_info: &'a ReplicationInfo) -> Self {
        Self {
            broker,
            peer,
            local_info,
            different_region: false,
        }
    }
}

/// Upcast helper so default hook bodies can pass `self` to the base.
pub trait AsDriver {
    fn as_driver(&self) -> &dyn ReplicationDriver;
}

impl<T: ReplicationDriver> AsDriver for T {
    fn as_driver(&self) -> &dyn ReplicationDriver {
        self
    }
}

/// Hooks the generic replicator calls while replicating one broker.
pub trait ReplicationDriver: AsDriver + Send + Sync {
    /// The generic replicator this driver extends.
    fn base(&self) -> &dyn BaseReplicator;

    fn gather_sync_args(&self, info: &ReplicationInfo) -> SyncArgs {
        self.base().gather_sync_args(info)
    }

    /// Act on a peer's `sync` response; `Ok(true)` means the peer is done.
    fn handle_sync_response<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        response: PeerResponse,
    ) -> HookFuture<'a, bool> {
        self.base().handle_sync_response(self.as_driver(), exchange, response)
    }

    fn in_sync<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        remote: &'a ReplicationInfo,
        local_sync: i64,
    ) -> HookFuture<'a, bool> {
        let in_sync = self.base().in_sync(remote, exchange.local_info, local_sync);
        Box::pin(async move { Ok(in_sync) })
    }

    /// Push whatever the peer is missing.
    fn choose_replication_mode<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        remote: &'a ReplicationInfo,
        local_sync: i64,
    ) -> HookFuture<'a, bool> {
        self.base().choose_replication_mode(exchange, remote, local_sync)
    }

    /// Runs once per broker after every peer was tried. `responses` holds
    /// one success flag per peer.
    fn post_replicate_hook<'a>(
        &'a self,
        broker: &'a Arc<dyn Broker>,
        info: &'a ReplicationInfo,
        responses: &'a [bool],
    ) -> HookFuture<'a, ()> {
        self.base().post_replicate_hook(broker, info, responses)
    }

    /// Decide whether a handoff replica can go. `Ok(true)` means the broker
    /// is dealt with (deleted or deliberately kept).
    fn cleanup_after_replicate<'a>(
        &'a self,
        broker: &'a Arc<dyn Broker>,
        info: &'a ReplicationInfo,
        responses: &'a [bool],
    ) -> HookFuture<'a, bool> {
        self.base().cleanup_after_replicate(self.as_driver(), broker, info, responses)
    }

    /// `Ok(true)` only once the database is gone; a deletion postponed to
    /// later in the pass is `Ok(false)`.
    fn delete_broker<'a>(&'a self, broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool> {
        self.base().delete_broker(broker)
    }

    fn is_locked<'a>(&'a self, broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool> {
        self.base().is_locked(broker)
    }

    /// Whether the account layer has seen this broker's current stats. A
    /// deleted broker is only reclaimed once it has.
    fn report_up_to_date(&self, info: &ReplicationInfo) -> bool {
        self.base().report_up_to_date(info)
    }
}

/// The generic row-diff replicator.
///
/// Implementations own the partition loop, peer RPC fan-out, row diffing
/// and bulk transfer.
pub trait BaseReplicator: Send + Sync + 'static {
    /// Ring ids of the devices mounted on this node.
    fn local_device_ids(&self) -> HashSet<u32>;

    /// Replicate every local broker once, calling `driver`'s hooks.
    fn run_pass<'a>(&'a self, driver: &'a dyn ReplicationDriver) -> HookFuture<'a, PassReport>;

    /// Replicate one broker to the primaries of `partition`.
    fn replicate_object<'a>(
        &'a self,
        driver: &'a dyn ReplicationDriver,
        partition: u32,
        broker: Arc<dyn Broker>,
        node_id: u32,
    ) -> HookFuture<'a, bool>;

    fn gather_sync_args(&self, info: &ReplicationInfo) -> SyncArgs {
        SyncArgs::from_info(info)
    }

    /// Decode the peer's info, then either stop (in sync) or push rows.
    fn handle_sync_response<'a>(
        &'a self,
        driver: &'a dyn ReplicationDriver,
        exchange: &'a SyncExchange<'a>,
        response: PeerResponse,
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            if !response.is_success() {
                return Ok(false);
            }
            let remote: ReplicationInfo = response.json()?;
            let local_sync = exchange.broker.get_sync(&remote.id).await?;
            if driver.in_sync(exchange, &remote, local_sync).await? {
                return Ok(true);
            }
            driver.choose_replication_mode(exchange, &remote, local_sync).await
        })
    }

    /// Nothing to push when the peer has the same rows or has already seen
    /// everything up to our `max_row`. `local_sync` is the outgoing sync
    /// point with this peer ([`Broker::get_sync`]).
    fn in_sync(&self, remote: &ReplicationInfo, local: &ReplicationInfo, local_sync: i64) -> bool {
        remote.hash == local.hash || local_sync >= local.max_row
    }

    /// Row diff or whole-file transfer. Rows that reach the peer are
    /// recorded with [`Broker::merge_syncs`].
    fn choose_replication_mode<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        remote: &'a ReplicationInfo,
        local_sync: i64,
    ) -> HookFuture<'a, bool>;

    fn post_replicate_hook<'a>(
        &'a self,
        _broker: &'a Arc<dyn Broker>,
        _info: &'a ReplicationInfo,
        _responses: &'a [bool],
    ) -> HookFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn cleanup_after_replicate<'a>(
        &'a self,
        driver: &'a dyn ReplicationDriver,
        broker: &'a Arc<dyn Broker>,
        info: &'a ReplicationInfo,
        responses: &'a [bool],
    ) -> HookFuture<'a, bool>;

    fn delete_broker<'a>(&'a self, broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool>;

    fn is_locked<'a>(&'a self, _broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    /// Generic databases keep no reported stats.
    fn report_up_to_date(&self, _info: &ReplicationInfo) -> bool {
        true
    }
}
