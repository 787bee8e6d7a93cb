// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer replication transport.
//!
//! The replicator talks to the replica of a container on another node with a
//! single verb: `REPLICATE /{device}/{partition}/{hash}` carrying a JSON array
//! body `[op, args...]`.
//!
//! ```text
//! REPLICATE /sdb/1234/9f1c…   ["get_shard_ranges"]
//!   200 application/json      [{"name": ".shards_AUTH_test/c-1", ...}]
//! ```
//!
//! The base replicator creates one [`PeerHandle`] per peer replica; hooks
//! only ever see the trait. [`HttpPeer`] is the reqwest implementation.
//!
//! # Timeouts
//!
//! Every call is bounded by `node_timeout`. A slow peer becomes a
//! [`ReplicationError::Timeout`] for that peer only.

use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::ring::Node;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::debug;

/// Boxed future returned by peer calls.
pub type PeerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A peer's answer to a replicate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl PeerResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A 200 response carrying `value` as JSON.
    pub fn json_ok<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(200, serde_json::to_vec(value)?))
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// One peer replica of the container being replicated.
pub trait PeerHandle: Send + Sync {
    /// The node holding the peer replica.
    fn node(&self) -> &Node;

    /// Call `op` on the peer replica.
    ///
    /// Transport failures and timeouts are errors; any HTTP status,
    /// including 4xx/5xx, is a response.
    fn replicate(&self, op: &str, args: Vec<Value>) -> PeerFuture<'_, PeerResponse>;
}

/// Build the shared HTTP client used for all peers.
pub fn http_client(conn_timeout: Duration, node_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(conn_timeout)
        .timeout(node_timeout)
        .build()
        .map_err(|e| ReplicationError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Shared HTTP client with the configured connect and RPC timeouts.
pub fn http_client_for(config: &ReplicatorConfig) -> Result<reqwest::Client> {
    http_client(config.conn_timeout_duration(), config.node_timeout_duration())
}

/// Peer replica reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: reqwest::Client,
    node: Node,
    partition: u32,
    db_hash: String,
    node_timeout: Duration,
}

impl HttpPeer {
    pub fn new(
        client: reqwest::Client,
        node: Node,
        partition: u32,
        db_hash: impl Into<String>,
        node_timeout: Duration,
    ) -> Self {
        Self {
            client,
            node,
            partition,
            db_hash: db_hash.into(),
            node_timeout,
        }
    }

    /// Peer bounded by the configured `node_timeout`.
    pub fn from_config(
        client: reqwest::Client,
        config: &ReplicatorConfig,
        node: Node,
        partition: u32,
        db_hash: impl Into<String>,
    ) -> Self {
        Self::new(client, node, partition, db_hash, config.node_timeout_duration())
    }

    /// Request URL for this replica.
    pub fn url(&self) -> String {
        format!(
            "http://{}:{}/{}/{}/{}",
            self.node.replication_ip, self.node.replication_port, self.node.device, self.partition, self.db_hash
        )
    }

    async fn send(&self, body: Vec<u8>) -> Result<PeerResponse> {
        let method = reqwest::Method::from_bytes(b"REPLICATE")
            .map_err(|e| ReplicationError::Internal(format!("Invalid HTTP method: {}", e)))?;
        let peer = self.node.address();

        let response = self
            .client
            .request(method, self.url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        debug!(peer = %peer, status, bytes = body.len(), "Peer replied");
        Ok(PeerResponse::new(status, body.to_vec()))
    }

    fn transport_error(&self, e: reqwest::Error) -> ReplicationError {
        if e.is_timeout() {
            self.timeout_error()
        } else {
            ReplicationError::peer(self.node.address(), e.to_string())
        }
    }

    fn timeout_error(&self) -> ReplicationError {
        ReplicationError::Timeout {
            peer: self.node.address(),
            timeout_ms: self.node_timeout.as_millis() as u64,
        }
    }
}

impl PeerHandle for HttpPeer {
    fn node(&self) -> &Node {
        &self.node
    }

    fn replicate(&self, op: &str, args: Vec<Value>) -> PeerFuture<'_, PeerResponse> {
        let op = op.to_string();
        Box::pin(async move {
            let mut call = Vec::with_capacity(args.len() + 1);
            call.push(Value::String(op.clone()));
            call.extend(args);
            let body = serde_json::to_vec(&call)?;

            let start = Instant::now();
            let result = match tokio::time::timeout(self.node_timeout, self.send(body)).await {
                Ok(result) => result,
                Err(_) => Err(self.timeout_error()),
            };
            let ok = matches!(&result, Ok(r) if r.is_success());
            metrics::record_peer_rpc(&op, ok, start.elapsed());
            result
        })
    }
}
