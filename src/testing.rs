//! Testing utilities for Raft cluster integration tests
//!
//! - `TestCluster`: nodes talking over real HTTP on ephemeral ports
//! - `InMemoryCluster`: nodes on the channel transport, for paused-time tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::client_http::create_client_router;
use crate::core::apply;
use crate::core::config::RaftConfig;
use crate::core::raft_core::{NodeId, RaftCore, RaftState, Status};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::state_machine::{run_apply_loop, SharedKvStore};
use crate::storage::memory::MemoryStorage;
use crate::transport::http::{create_router, HttpTransport};
use crate::transport::inmemory::{create_cluster_with_timeout, NetworkControl};

/// A single test node in the cluster
pub struct TestNode {
    pub id: NodeId,
    /// Serves both Raft RPCs and the client API
    pub addr: SocketAddr,
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    pub raft_handle: RaftHandle,
    pub kv_store: SharedKvStore,
    pub shared_core: SharedCore,
}

impl TestNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// A test cluster of Raft nodes over HTTP
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the specified number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, None).await
    }

    /// Create and start a cluster with the specified number of nodes and config
    pub async fn with_nodes_and_config(count: usize, config: Option<RaftConfig>) -> Self {
        let node_ids: Vec<NodeId> = (1..=count as NodeId).collect();

        // Bind all listeners first so every node knows every address
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &node_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        let config = config.unwrap_or_else(|| {
            RaftConfig::default()
                .with_heartbeat_interval(Duration::from_millis(50))
                .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        });

        let mut nodes = Vec::new();
        for (id, listener, addr) in listeners {
            let peers: HashMap<NodeId, String> = addrs
                .iter()
                .filter(|(&peer_id, _)| peer_id != id)
                .map(|(&peer_id, addr)| (peer_id, addr.clone()))
                .collect();
            let peer_ids: Vec<NodeId> = peers.keys().copied().collect();

            let kv_store = SharedKvStore::default();
            let (apply_tx, committed) = apply::channel();
            tokio::spawn(run_apply_loop(committed, kv_store.clone()));

            let transport = HttpTransport::new(peers, Duration::from_secs(2)).unwrap();
            let core = RaftCore::new(id, peer_ids, Box::new(MemoryStorage::new()), apply_tx).unwrap();
            let (server, shared_core) = RaftServer::with_config(core, transport, config.clone());
            let raft_handle = server.start();

            let app = create_combined_router(shared_core.clone(), raft_handle.clone(), kv_store.clone());
            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });

            nodes.push(TestNode {
                id,
                addr,
                http_shutdown_tx: Some(http_shutdown_tx),
                raft_handle,
                kv_store,
                shared_core,
            });
        }

        // Give servers time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        TestCluster { nodes }
    }

    /// Shutdown all nodes gracefully
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
            node.raft_handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn node_addr(&self, index: usize) -> SocketAddr {
        self.nodes[index].addr()
    }

    pub fn all_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.addr()).collect()
    }

    /// Poll `/client/status` on live nodes until one reports Leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<SocketAddr> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Some(addr) = self.find_node_in_state(RaftState::Leader).await {
                return Some(addr);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    pub async fn find_leader(&self) -> Option<SocketAddr> {
        self.find_node_in_state(RaftState::Leader).await
    }

    pub async fn find_follower(&self) -> Option<SocketAddr> {
        self.find_node_in_state(RaftState::Follower).await
    }

    async fn find_node_in_state(&self, state: RaftState) -> Option<SocketAddr> {
        // Short timeout so nodes that were shut down do not stall the poll
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        for node in &self.nodes {
            if node.http_shutdown_tx.is_none() {
                continue;
            }
            let Ok(response) = client
                .get(format!("http://{}/client/status", node.addr))
                .send()
                .await
            else {
                continue;
            };
            if let Ok(status) = response.json::<Status>().await {
                if status.state == state {
                    return Some(node.addr);
                }
            }
        }
        None
    }

    pub fn kv_store(&self, index: usize) -> SharedKvStore {
        self.nodes[index].kv_store.clone()
    }

    /// Index of the node listening on `addr`
    pub fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.nodes.iter().position(|n| n.addr == addr)
    }

    /// Shutdown a specific node (both HTTP and Raft servers)
    pub async fn shutdown_node(&mut self, index: usize) {
        if let Some(tx) = self.nodes[index].http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.nodes[index].raft_handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Raft RPC routes and client API on one listener
fn create_combined_router(core: SharedCore, handle: RaftHandle, kv_store: SharedKvStore) -> Router {
    create_router(core).merge(create_client_router(handle, kv_store))
}

/// A node of an `InMemoryCluster`
pub struct InMemoryNode {
    pub id: NodeId,
    pub core: SharedCore,
    pub handle: RaftHandle,
    pub kv_store: SharedKvStore,
}

/// A cluster on the channel transport. Every node runs its server loop,
/// serves inbound RPCs and feeds its own key-value store. Works under
/// `#[tokio::test(start_paused = true)]`.
pub struct InMemoryCluster {
    pub nodes: Vec<InMemoryNode>,
    network: NetworkControl,
}

impl InMemoryCluster {
    /// Start `count` nodes with ids 1..=count. Must run inside a tokio runtime.
    pub fn new(count: usize, config: RaftConfig) -> Self {
        let node_ids: Vec<NodeId> = (1..=count as NodeId).collect();
        let rpc_timeout = config.heartbeat_interval;
        let (mut transports, mut handles) = create_cluster_with_timeout(&node_ids, Some(rpc_timeout));

        let network = transports
            .values()
            .next()
            .map(|t| t.network())
            .unwrap_or_default();
        let mut nodes = Vec::new();
        for &id in &node_ids {
            let peers = node_ids.iter().copied().filter(|&p| p != id).collect();
            let transport = transports.remove(&id).unwrap();

            let kv_store = SharedKvStore::default();
            let (apply_tx, committed) = apply::channel();
            tokio::spawn(run_apply_loop(committed, kv_store.clone()));

            let core = RaftCore::new(id, peers, Box::new(MemoryStorage::new()), apply_tx).unwrap();
            let (server, shared) = RaftServer::with_config(core, transport, config.clone());
            tokio::spawn(handles.remove(&id).unwrap().serve(shared.clone()));

            nodes.push(InMemoryNode {
                id,
                core: shared,
                handle: server.start(),
                kv_store,
            });
        }

        InMemoryCluster { nodes, network }
    }

    pub fn network(&self) -> &NetworkControl {
        &self.network
    }

    pub fn node(&self, id: NodeId) -> &InMemoryNode {
        &self.nodes[(id - 1) as usize]
    }

    pub async fn statuses(&self) -> Vec<Status> {
        let mut statuses = Vec::new();
        for node in &self.nodes {
            statuses.push(node.core.lock().await.status());
        }
        statuses
    }

    /// The leader with the highest term among nodes that can reach a majority
    pub async fn leader(&self) -> Option<NodeId> {
        let majority = self.nodes.len() / 2 + 1;
        self.statuses()
            .await
            .into_iter()
            .filter(|s| s.state == RaftState::Leader)
            .filter(|s| {
                let reachable = self
                    .nodes
                    .iter()
                    .filter(|n| n.id == s.node_id || self.network.can_reach(s.node_id, n.id))
                    .count();
                reachable >= majority
            })
            .max_by_key(|s| s.term)
            .map(|s| s.node_id)
    }

    /// Let the cluster run until a majority-backed leader exists
    pub async fn wait_for_leader(&self, max_wait: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + max_wait;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = self.leader().await {
                return Some(leader);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Let the cluster run until every node in `ids` has applied `index`
    pub async fn wait_for_applied(&self, ids: &[NodeId], index: u64, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        while tokio::time::Instant::now() < deadline {
            let mut done = true;
            for &id in ids {
                if self.node(id).core.lock().await.last_applied < index {
                    done = false;
                }
            }
            if done {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
