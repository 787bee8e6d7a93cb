//! Mock PeerHandle for testing.
//!
//! Answers each op with a configured reply (or a transport failure) and
//! records every call for assertions.

use container_replicator::error::{ReplicationError, Result};
use container_replicator::peer::{PeerFuture, PeerHandle, PeerResponse};
use container_replicator::ring::Node;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// A recorded replicate() call.
#[derive(Debug, Clone)]
pub struct PeerCall {
    pub op: String,
    pub args: Vec<Value>,
}

/// Scripted peer replica.
///
/// # Example
/// ```rust,ignore
/// let peer = MockPeer::new(node(4))
///     .reply("sync", PeerResponse::json_ok(&remote_info).unwrap())
///     .unreachable("merge_items");
///
/// // Use in tests...
///
/// assert_eq!(peer.ops(), vec!["sync", "get_shard_ranges"]);
/// ```
pub struct MockPeer {
    node: Node,
    /// Replies by op; `None` simulates a transport failure
    replies: HashMap<String, Option<PeerResponse>>,
    /// Reply for ops without a configured one
    default_reply: Option<PeerResponse>,
    calls: Mutex<Vec<PeerCall>>,
}

impl MockPeer {
    /// Peer answering `200 []` to everything.
    pub fn new(node: Node) -> Self {
        Self {
            node,
            replies: HashMap::new(),
            default_reply: Some(PeerResponse::new(200, "[]")),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Peer that cannot be reached at all.
    pub fn down(node: Node) -> Self {
        Self {
            default_reply: None,
            ..Self::new(node)
        }
    }

    pub fn reply(mut self, op: &str, response: PeerResponse) -> Self {
        self.replies.insert(op.to_string(), Some(response));
        self
    }

    pub fn unreachable(mut self, op: &str) -> Self {
        self.replies.insert(op.to_string(), None);
        self
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.op).collect()
    }

    /// Arguments of the first call to `op`.
    pub fn args_of(&self, op: &str) -> Option<Vec<Value>> {
        self.calls().into_iter().find(|c| c.op == op).map(|c| c.args)
    }
}

impl PeerHandle for MockPeer {
    fn node(&self) -> &Node {
        &self.node
    }

    fn replicate(&self, op: &str, args: Vec<Value>) -> PeerFuture<'_, PeerResponse> {
        self.calls.lock().unwrap().push(PeerCall {
            op: op.to_string(),
            args,
        });
        let reply = match self.replies.get(op) {
            Some(reply) => reply.clone(),
            None => self.default_reply.clone(),
        };
        let address = self.node.address();
        let result: Result<PeerResponse> =
            reply.ok_or_else(|| ReplicationError::peer(address, "connection refused"));
        Box::pin(async move { result })
    }
}
