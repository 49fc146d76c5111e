//! In-memory transport implementation for testing
//!
//! Each node gets a request channel. `NodeHandle` drains it against a core;
//! `NetworkControl` can cut nodes or links to simulate partitions.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RaftCore, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// Request types that can be sent to a node
pub(crate) enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
}

#[derive(Debug, Default)]
struct Partitions {
    isolated: BTreeSet<NodeId>,
    /// Cut links, stored with the smaller id first
    dropped: BTreeSet<(NodeId, NodeId)>,
}

/// Shared switchboard for simulated network failures
#[derive(Debug, Clone, Default)]
pub struct NetworkControl {
    partitions: Arc<RwLock<Partitions>>,
}

impl NetworkControl {
    /// Cut every link to and from `node`
    pub fn isolate(&self, node: NodeId) {
        self.write().isolated.insert(node);
    }

    /// Restore the links of an isolated node
    pub fn heal(&self, node: NodeId) {
        self.write().isolated.remove(&node);
    }

    /// Cut the link between two nodes, in both directions
    pub fn drop_between(&self, a: NodeId, b: NodeId) {
        self.write().dropped.insert((a.min(b), a.max(b)));
    }

    pub fn heal_all(&self) {
        let mut partitions = self.write();
        partitions.isolated.clear();
        partitions.dropped.clear();
    }

    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        !partitions.isolated.contains(&from)
            && !partitions.isolated.contains(&to)
            && !partitions.dropped.contains(&(from.min(to), from.max(to)))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Partitions> {
        self.partitions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    id: NodeId,
    /// Senders to each node's request channel
    senders: HashMap<NodeId, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
    network: NetworkControl,
}

impl InMemoryTransport {
    /// Handle to the partition switchboard shared by the whole cluster
    pub fn network(&self) -> NetworkControl {
        self.network.clone()
    }

    async fn call<R>(
        &self,
        target: NodeId,
        make_request: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;
        if !self.network.can_reach(self.id, target) {
            return Err(TransportError::ConnectionFailed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        let reply = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => reply_rx.await,
        };
        let reply = reply.map_err(|_| TransportError::ConnectionFailed)?;

        // A partition that formed while the request was in flight eats the reply
        if !self.network.can_reach(self.id, target) {
            return Err(TransportError::ConnectionFailed);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, |reply| Request::RequestVote { args, reply }).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, |reply| Request::AppendEntries { args, reply }).await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request using the given RaftCore
    pub async fn process_one(&mut self, node: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, node);
                true
            }
            None => false,
        }
    }

    /// Process one request using a shared core. Receives first, then locks
    /// only while the request is handled.
    pub async fn process_one_shared(&mut self, node: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut n = node.lock().await;
                Self::handle_request(request, &mut n);
                true
            }
            None => false,
        }
    }

    /// Serve requests until every sender is gone
    pub async fn serve(mut self, node: SharedCore) {
        while self.process_one_shared(&node).await {}
    }

    /// A request whose state could not be persisted gets no reply; the
    /// caller sees a failed connection.
    fn handle_request(request: Request, node: &mut RaftCore) {
        match request {
            Request::RequestVote { args, reply } => match node.handle_request_vote(&args) {
                Ok(result) => {
                    let _ = reply.send(result);
                }
                Err(e) => error!(node = node.id, error = %e, "failed to persist vote"),
            },
            Request::AppendEntries { args, reply } => match node.handle_append_entries(&args) {
                Ok(result) => {
                    let _ = reply.send(result);
                }
                Err(e) => error!(node = node.id, error = %e, "failed to persist entries"),
            },
        }
    }
}

/// Create transports and handles for a cluster of nodes
pub fn create_cluster(
    node_ids: &[NodeId],
) -> (HashMap<NodeId, InMemoryTransport>, HashMap<NodeId, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster of nodes with optional timeout.
/// All transports share one `NetworkControl`.
pub fn create_cluster_with_timeout(
    node_ids: &[NodeId],
    timeout: Option<Duration>,
) -> (HashMap<NodeId, InMemoryTransport>, HashMap<NodeId, NodeHandle>) {
    let mut senders: HashMap<NodeId, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<NodeId, NodeHandle> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let network = NetworkControl::default();
    let mut transports: HashMap<NodeId, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<NodeId, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        transports.insert(
            id,
            InMemoryTransport {
                id,
                senders: other_senders,
                timeout,
                network: network.clone(),
            },
        );
    }

    (transports, handles)
}
