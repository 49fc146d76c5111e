//! RaftNode - elections and replication over a `Transport`
//!
//! Every operation follows the same shape: lock the core to build requests,
//! release it while RPCs are in flight, then relock per reply.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::raft_core::{NodeId, RaftCore, RaftState, ReplicationProgress};
use crate::storage::StorageError;
use crate::transport::Transport;

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// High-level Raft node that drives consensus operations
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: Arc<T>,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport + 'static> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport: Arc::new(transport),
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Start an election. Returns true if this node won outright.
    pub async fn start_election(&self) -> Result<bool, StorageError> {
        self.core.lock().await.start_election()
    }

    /// Request votes from all peers concurrently.
    /// Returns true as soon as a majority is reached.
    pub async fn request_votes(&self) -> Result<bool, StorageError> {
        let (args, peers) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Candidate {
                return Ok(false);
            }
            (core.request_vote_args(), core.peers.clone())
        };

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer, transport.request_vote(peer, args).await) }
            })
            .collect();

        while let Some((peer, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_result(peer, args.term, &result)? {
                        return Ok(true);
                    }
                }
                Err(e) => {
                    debug!(node = args.candidate_id, peer, error = %e, "RequestVote failed");
                }
            }
        }

        Ok(false)
    }

    /// Bring one peer up to date for leader term `term`. Retries immediately
    /// after a mismatch and keeps sending while the leader's log is ahead.
    pub async fn replicate_to_peer(
        &self,
        peer: NodeId,
        term: u64,
    ) -> Result<ReplicationProgress, StorageError> {
        loop {
            let args = {
                let core = self.core.lock().await;
                match core.append_entries_for(peer, term) {
                    Some(args) => args,
                    None => return Ok(ReplicationProgress::Stale),
                }
            };
            let prev_log_index = args.prev_log_index;
            let entry_count = args.entries.len();

            let result = match self.transport.append_entries(peer, args).await {
                Ok(result) => result,
                Err(e) => {
                    debug!(peer, term, error = %e, "AppendEntries failed");
                    return Ok(ReplicationProgress::Unreachable);
                }
            };

            let progress = {
                let mut core = self.core.lock().await;
                core.handle_append_entries_result(peer, term, prev_log_index, entry_count, &result)?
            };

            match progress {
                ReplicationProgress::Backtrack | ReplicationProgress::CatchingUp => continue,
                other => return Ok(other),
            }
        }
    }

    /// Run one replication round to every peer concurrently.
    /// Returns the number of peers that are now up to date.
    pub async fn broadcast_append_entries(&self) -> Result<usize, StorageError> {
        let (term, peers) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return Ok(0);
            }
            (core.current_term, core.peers.clone())
        };

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer| self.replicate_to_peer(peer, term))
            .collect();

        let mut up_to_date = 0;
        while let Some(progress) = futures.next().await {
            if progress? == ReplicationProgress::UpToDate {
                up_to_date += 1;
            }
        }
        Ok(up_to_date)
    }

    /// Replication loop for one peer while this node leads `term`. Wakes on
    /// every heartbeat tick and whenever `wake` is notified of a new entry.
    /// Ends when leadership of `term` is lost; a storage failure is returned.
    pub async fn run_peer_replication(
        self,
        peer: NodeId,
        term: u64,
        wake: Arc<Notify>,
        heartbeat_interval: Duration,
    ) -> Result<(), StorageError> {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }

            match self.replicate_to_peer(peer, term).await? {
                ReplicationProgress::SteppedDown | ReplicationProgress::Stale => break,
                _ => {}
            }
        }
        debug!(peer, term, "replication task finished");
        Ok(())
    }

    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }
}
