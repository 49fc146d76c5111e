//! RaftServer - event loop driving a Raft node
//!
//! Owns the election timer, starts per-peer replication tasks when the node
//! wins an election and serializes client submissions through a channel.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

use super::config::RaftConfig;
use super::raft_core::{NodeId, RaftCore, RaftState, Status};
use super::raft_node::{RaftNode, SharedCore};
use crate::storage::StorageError;
use crate::transport::Transport;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },
    /// Persistent state could not be written
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    /// The server loop is no longer running
    #[error("raft server has shut down")]
    Shutdown,
}

/// Where a submitted command landed in the leader's log. Being appended is
/// not being committed; watch the apply stream for `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// Command sent to the RaftServer from clients
enum Command {
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<Proposal, RaftError>>,
    },
}

/// Reports from tasks spawned by the server loop
enum ServerEvent {
    /// The vote collection for `term` reached a majority
    ElectionWon { term: u64 },
    /// A background task could not persist state
    StorageFailed(StorageError),
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    core: SharedCore,
}

impl RaftHandle {
    /// Append a command to the leader's log and return its position.
    /// Returns as soon as the entry is appended locally.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;

        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Snapshot of role, term and indices
    pub async fn status(&self) -> Status {
        self.core.lock().await.status()
    }

    /// Stop the server loop and its replication tasks
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Raft server that handles client commands and coordinates with RaftNode
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    config: RaftConfig,
    /// Vote collection for the latest election, if still running
    vote_task: Option<JoinHandle<()>>,
    peer_tasks: Vec<JoinHandle<()>>,
    peer_wakers: HashMap<NodeId, Arc<Notify>>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a new RaftServer with default config
    /// Returns the server and shared core for RPC handling
    pub fn new(core: RaftCore, transport: T) -> (Self, SharedCore) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a new RaftServer with custom config
    /// Returns the server and shared core for RPC handling
    pub fn with_config(mut core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        core.set_config(config.clone());
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = RaftNode::new(core, transport);
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            events_rx,
            events_tx,
            config,
            vote_task: None,
            peer_tasks: Vec::new(),
            peer_wakers: HashMap::new(),
        };
        (server, shared_core)
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            core: self.node.shared_core(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(mut self) {
        // Leadership may have been won before the loop started
        if self.node.state().await == RaftState::Leader {
            self.start_peer_replication().await;
        }

        loop {
            let election_deadline = self.node.shared_core().lock().await.election_deadline;

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        Command::Submit { command, reply } => {
                            let result = self.handle_submit(command).await;
                            let failed = matches!(result, Err(RaftError::Storage(_)));
                            let _ = reply.send(result);
                            if failed {
                                break;
                            }
                        }
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    match event {
                        ServerEvent::ElectionWon { term } => self.handle_election_won(term).await,
                        ServerEvent::StorageFailed(e) => {
                            error!(error = %e, "storage failure in background task, stopping node");
                            break;
                        }
                    }
                }
                _ = sleep_until(election_deadline) => {
                    if let Err(e) = self.handle_election_timeout().await {
                        error!(error = %e, "storage failure during election, stopping node");
                        break;
                    }
                }
            }
        }

        self.stop_vote_collection();
        self.stop_peer_replication();
        let id = self.node.shared_core().lock().await.id;
        info!(node = id, "raft server stopped");
    }

    /// Called when the election deadline passes. The deadline may have moved
    /// while we slept, so it is checked again under the lock. Votes are
    /// collected in a spawned task that reports a win as `ElectionWon`.
    async fn handle_election_timeout(&mut self) -> Result<(), StorageError> {
        let (won_outright, term) = {
            let core = self.node.shared_core();
            let mut core = core.lock().await;
            if core.state == RaftState::Leader {
                core.reset_election_timer();
                return Ok(());
            }
            if Instant::now() < core.election_deadline {
                return Ok(());
            }
            (core.start_election()?, core.current_term)
        };

        // Replies to an older election can no longer count
        self.stop_vote_collection();
        if won_outright {
            self.start_peer_replication().await;
            return Ok(());
        }

        let node = self.node.clone();
        let events = self.events_tx.clone();
        self.vote_task = Some(tokio::spawn(async move {
            match node.request_votes().await {
                Ok(true) => {
                    let _ = events.send(ServerEvent::ElectionWon { term });
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = events.send(ServerEvent::StorageFailed(e));
                }
            }
        }));
        Ok(())
    }

    /// Start replicating if the win is still current
    async fn handle_election_won(&mut self, term: u64) {
        let still_leader = {
            let core = self.node.shared_core();
            let core = core.lock().await;
            core.state == RaftState::Leader && core.current_term == term
        };
        if still_leader {
            self.start_peer_replication().await;
        }
    }

    fn stop_vote_collection(&mut self) {
        if let Some(task) = self.vote_task.take() {
            task.abort();
        }
    }

    /// Spawn one replication task per peer for the current term
    async fn start_peer_replication(&mut self) {
        self.stop_peer_replication();

        let (term, peers) = {
            let core = self.node.shared_core();
            let core = core.lock().await;
            (core.current_term, core.peers.clone())
        };

        for peer in peers {
            let wake = Arc::new(Notify::new());
            self.peer_wakers.insert(peer, wake.clone());
            let task = self.node.clone().run_peer_replication(
                peer,
                term,
                wake,
                self.config.heartbeat_interval,
            );
            let events = self.events_tx.clone();
            self.peer_tasks.push(tokio::spawn(async move {
                if let Err(e) = task.await {
                    let _ = events.send(ServerEvent::StorageFailed(e));
                }
            }));
        }
    }

    fn stop_peer_replication(&mut self) {
        for task in self.peer_tasks.drain(..) {
            task.abort();
        }
        self.peer_wakers.clear();
    }

    /// Append a client command and wake the replication tasks
    async fn handle_submit(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        let entry = {
            let shared_core = self.node.shared_core();
            let mut core = shared_core.lock().await;
            match core.append_log_entry(command)? {
                Some(entry) => entry,
                None => {
                    return Err(RaftError::NotLeader {
                        leader_hint: core.current_leader,
                    })
                }
            }
        };

        for wake in self.peer_wakers.values() {
            wake.notify_one();
        }

        Ok(Proposal {
            index: entry.index,
            term: entry.term,
        })
    }

    /// Start an election (delegates to RaftNode)
    pub async fn start_election(&self) -> Result<bool, RaftError> {
        Ok(self.node.start_election().await?)
    }

    /// Request votes from all peers (delegates to RaftNode)
    pub async fn request_votes(&self) -> Result<bool, RaftError> {
        Ok(self.node.request_votes().await?)
    }

    pub async fn state(&self) -> RaftState {
        self.node.state().await
    }

    pub async fn commit_index(&self) -> u64 {
        self.node.commit_index().await
    }
}
