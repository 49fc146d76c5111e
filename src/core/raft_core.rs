//! Raft consensus state machine (sync, transport-agnostic)
//!
//! Implements the rules from "In Search of an Understandable Consensus
//! Algorithm" (Ongaro and Ousterhout). Every method runs under the
//! `SharedCore` mutex and performs no network I/O; `RaftNode` prepares
//! requests here, releases the lock, sends them, then folds the replies
//! back in.

use std::cmp::min;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::apply::{ApplySender, CommittedEntry};
use super::config::RaftConfig;
use super::log::{Log, LogEntry};
use crate::storage::{Storage, StorageError};

pub type NodeId = u64;

/// Raft node roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Passive; accepts entries from the leader
    Follower,
    /// Seeking votes to become leader
    Candidate,
    /// Accepts client commands and replicates the log
    Leader,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Voter's current term, for the candidate to update itself
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: u64,
    /// Term of prev_log_index entry
    pub prev_log_term: u64,
    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Follower's current term, for the leader to update itself
    pub term: u64,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
}

/// Outcome of folding one AppendEntries reply into leader state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationProgress {
    /// Follower holds everything the leader has
    UpToDate,
    /// Follower accepted the request, but the leader's log has grown since
    CatchingUp,
    /// Log mismatch; next_index moved back by one
    Backtrack,
    /// Reply carried a higher term and this node stepped down
    SteppedDown,
    /// Reply was for an older term or role, or this node is no longer leader
    Stale,
    /// Request never got a reply
    Unreachable,
}

/// Point-in-time view of a node, for status endpoints and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub node_id: NodeId,
    pub state: RaftState,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

/// Core Raft state (sync, transport-agnostic)
pub struct RaftCore {
    storage: Box<dyn Storage>,
    apply_tx: ApplySender,
    config: RaftConfig,

    // Persistent state, cached in memory and written through `storage`
    /// Latest term this node has seen (0 on first boot, increases monotonically)
    pub current_term: u64,
    /// Candidate that received this node's vote in current_term
    pub voted_for: Option<NodeId>,
    pub log: Log,

    // Volatile state on all servers
    /// Highest log index known to be committed (increases monotonically)
    pub commit_index: u64,
    /// Highest log index handed to the apply channel
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// Next log index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Highest log index known to be replicated on each peer
    pub match_index: HashMap<NodeId, u64>,

    pub id: NodeId,
    pub state: RaftState,
    /// Other members of the cluster
    pub peers: Vec<NodeId>,
    votes_received: HashSet<NodeId>,
    /// Last known leader, used as a redirect hint
    pub current_leader: Option<NodeId>,
    /// When a follower or candidate should start the next election
    pub election_deadline: Instant,
}

impl RaftCore {
    /// Create a core, restoring term, vote and log from `storage`.
    /// Committed entries are pushed to `apply_tx` as they are applied.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: Box<dyn Storage>,
        apply_tx: ApplySender,
    ) -> Result<Self, StorageError> {
        let current_term = storage.load_term()?;
        let voted_for = storage.load_voted_for()?;
        let log = Log::restore(storage.load_log()?)?;
        let config = RaftConfig::default();
        let election_deadline = Instant::now() + config.random_election_timeout();

        if log.last_index() > 0 {
            info!(
                node = id,
                term = current_term,
                last_index = log.last_index(),
                "restored persistent state"
            );
        }

        Ok(RaftCore {
            storage,
            apply_tx,
            config,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            votes_received: HashSet::new(),
            current_leader: None,
            election_deadline,
        })
    }

    /// Replace the timing configuration and re-arm the election timer
    pub fn set_config(&mut self, config: RaftConfig) {
        self.config = config;
        self.reset_election_timer();
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    // === Persistence helpers ===

    fn set_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.storage.save_term(term)?;
        self.current_term = term;
        Ok(())
    }

    fn set_voted_for(&mut self, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.storage.save_voted_for(voted_for)?;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Move to a newer term with no vote cast.
    /// The term is written first: a crash in between leaves the old vote
    /// attached to the new term, which can only cause a refusal.
    fn update_term(&mut self, new_term: u64) -> Result<(), StorageError> {
        self.set_term(new_term)?;
        self.set_voted_for(None)
    }

    fn persist_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.storage.append_log_entries(entries)?;
        for entry in entries {
            self.log.push(entry.clone());
        }
        Ok(())
    }

    fn persist_truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        if from_index <= self.log.last_index() {
            self.storage.truncate_log(from_index)?;
            self.log.truncate_from(from_index);
        }
        Ok(())
    }

    // === Small accessors ===

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the cluster, self included
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    pub fn status(&self) -> Status {
        Status {
            node_id: self.id,
            state: self.state,
            term: self.current_term,
            leader_id: self.current_leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    /// Push the election deadline out by a freshly drawn timeout
    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    /// Adopt `term` if it is newer and fall back to follower
    fn step_down(&mut self, term: u64) -> Result<(), StorageError> {
        if term > self.current_term {
            self.update_term(term)?;
            self.current_leader = None;
        }
        if self.state != RaftState::Follower {
            if self.state == RaftState::Leader {
                // Leaders do not keep an election deadline
                self.reset_election_timer();
            }
            info!(
                node = self.id,
                term = self.current_term,
                was = ?self.state,
                "stepped down to follower"
            );
            self.state = RaftState::Follower;
        }
        Ok(())
    }

    /// Check if the candidate's log is at least as up-to-date as ours:
    /// compare (last_log_term, last_log_index) lexicographically
    pub fn is_log_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        (candidate_last_term, candidate_last_index) >= (self.last_log_term(), self.last_log_index())
    }

    // === RPC handlers ===

    /// Handle RequestVote RPC
    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteResult, StorageError> {
        if args.term < self.current_term {
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if args.term > self.current_term {
            self.step_down(args.term)?;
        }

        let free_to_vote = match self.voted_for {
            None => true,
            Some(candidate) => candidate == args.candidate_id,
        };
        if !free_to_vote || !self.is_log_up_to_date(args.last_log_term, args.last_log_index) {
            debug!(
                node = self.id,
                term = self.current_term,
                candidate = args.candidate_id,
                "vote denied"
            );
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Persist the vote before replying
        if self.voted_for != Some(args.candidate_id) {
            self.set_voted_for(Some(args.candidate_id))?;
        }
        self.reset_election_timer();
        debug!(
            node = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            "vote granted"
        );

        Ok(RequestVoteResult {
            term: self.current_term,
            vote_granted: true,
        })
    }

    /// Handle AppendEntries RPC (heartbeat or log replication)
    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, StorageError> {
        if args.term < self.current_term {
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
            });
        }

        // A live leader for this term: follow it and hold off elections
        self.step_down(args.term)?;
        self.current_leader = Some(args.leader_id);
        self.reset_election_timer();

        let reject = AppendEntriesResult {
            term: self.current_term,
            success: false,
        };

        if !self.log.matches(args.prev_log_index, args.prev_log_term) {
            debug!(
                node = self.id,
                prev_log_index = args.prev_log_index,
                prev_log_term = args.prev_log_term,
                last_index = self.log.last_index(),
                "log mismatch, rejecting append"
            );
            return Ok(reject);
        }

        let contiguous = args
            .entries
            .iter()
            .zip(args.prev_log_index + 1..)
            .all(|(entry, expected)| entry.index == expected);
        if !contiguous {
            warn!(node = self.id, leader = args.leader_id, "non-contiguous entries in append");
            return Ok(reject);
        }

        self.merge_entries(&args.entries)?;

        let last_new_index = args.prev_log_index + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            let new_commit = min(args.leader_commit, last_new_index);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                self.apply_committed_entries();
            }
        }

        Ok(AppendEntriesResult {
            term: self.current_term,
            success: true,
        })
    }

    /// Merge entries that follow a matched prev_log_index. Entries already
    /// present with the same term are kept; from the first conflict on, the
    /// local suffix is replaced.
    fn merge_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(first_new) = entries
            .iter()
            .position(|e| !self.log.matches(e.index, e.term))
        else {
            return Ok(());
        };

        let from = entries[first_new].index;
        if from <= self.log.last_index() {
            debug!(node = self.id, from, "truncating conflicting suffix");
            self.persist_truncate_log(from)?;
        }
        self.persist_log_entries(&entries[first_new..])?;
        debug!(
            node = self.id,
            count = entries.len() - first_new,
            last_index = self.log.last_index(),
            "replicated entries"
        );
        Ok(())
    }

    // === Election ===

    /// Begin a new election. Returns true if this node won outright
    /// (single-member cluster).
    pub fn start_election(&mut self) -> Result<bool, StorageError> {
        self.set_term(self.current_term + 1)?;
        self.set_voted_for(Some(self.id))?;
        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.reset_election_timer();
        info!(node = self.id, term = self.current_term, "became candidate");

        if self.votes_received.len() >= self.quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn request_vote_args(&self) -> RequestVoteArgs {
        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Fold a RequestVote reply into the tally. `election_term` is the term
    /// the request was sent in. Returns true if this reply made us leader.
    pub fn handle_request_vote_result(
        &mut self,
        peer: NodeId,
        election_term: u64,
        result: &RequestVoteResult,
    ) -> Result<bool, StorageError> {
        if result.term > self.current_term {
            self.step_down(result.term)?;
            return Ok(false);
        }

        if self.state != RaftState::Candidate || self.current_term != election_term {
            return Ok(false);
        }

        if !result.vote_granted {
            return Ok(false);
        }

        self.votes_received.insert(peer);
        debug!(
            node = self.id,
            term = self.current_term,
            from = peer,
            votes = self.votes_received.len(),
            "vote received"
        );

        if self.votes_received.len() >= self.quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Take leadership for the current term. Appends a no-op so entries
    /// from earlier terms can be committed through it.
    pub fn become_leader(&mut self) -> Result<(), StorageError> {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        info!(node = self.id, term = self.current_term, "became leader");

        // Initialized before the no-op so the first round carries it
        let next = self.log.len();
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        self.append_own_entry(None)?;
        Ok(())
    }

    // === Replication (leader side) ===

    /// Append a client command. Returns `None` when this node is not leader.
    pub fn append_log_entry(&mut self, command: Vec<u8>) -> Result<Option<LogEntry>, StorageError> {
        if self.state != RaftState::Leader {
            return Ok(None);
        }
        let entry = self.append_own_entry(Some(command))?;
        debug!(node = self.id, index = entry.index, term = entry.term, "appended entry");
        Ok(Some(entry))
    }

    fn append_own_entry(&mut self, command: Option<Vec<u8>>) -> Result<LogEntry, StorageError> {
        let entry = LogEntry {
            term: self.current_term,
            index: self.log.len(),
            command,
        };
        self.persist_log_entries(std::slice::from_ref(&entry))?;
        // With no peers the leader alone is a majority
        self.advance_commit_index();
        Ok(entry)
    }

    /// Build the next AppendEntries for `peer`, or `None` if this node is no
    /// longer leader of `term`
    pub fn append_entries_for(&self, peer: NodeId, term: u64) -> Option<AppendEntriesArgs> {
        if self.state != RaftState::Leader || self.current_term != term {
            return None;
        }

        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.len())
            .clamp(1, self.log.len());
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?;

        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    /// Fold an AppendEntries reply from `peer` into leader state.
    /// `request_term`, `prev_log_index` and `entry_count` describe the
    /// request that produced it.
    pub fn handle_append_entries_result(
        &mut self,
        peer: NodeId,
        request_term: u64,
        prev_log_index: u64,
        entry_count: usize,
        result: &AppendEntriesResult,
    ) -> Result<ReplicationProgress, StorageError> {
        if result.term > self.current_term {
            self.step_down(result.term)?;
            return Ok(ReplicationProgress::SteppedDown);
        }

        if self.state != RaftState::Leader || self.current_term != request_term {
            return Ok(ReplicationProgress::Stale);
        }

        if result.success {
            let matched = prev_log_index + entry_count as u64;
            let match_index = self.match_index.entry(peer).or_insert(0);
            if matched > *match_index {
                *match_index = matched;
            }
            let next_index = self.next_index.entry(peer).or_insert(0);
            if matched + 1 > *next_index {
                *next_index = matched + 1;
            }
            self.advance_commit_index();

            if matched < self.log.last_index() {
                return Ok(ReplicationProgress::CatchingUp);
            }
            return Ok(ReplicationProgress::UpToDate);
        }

        // Genesis always matches, so a rejection at index 0 cannot be fixed
        // by backing up further
        if prev_log_index == 0 {
            return Ok(ReplicationProgress::Stale);
        }
        self.next_index.insert(peer, prev_log_index);
        debug!(node = self.id, peer, next_index = prev_log_index, "backtracking");
        Ok(ReplicationProgress::Backtrack)
    }

    // === Commit and apply ===

    /// Recompute commit_index from the majority match index. Only entries
    /// from the current term are committed by counting replicas.
    pub fn advance_commit_index(&mut self) -> Option<u64> {
        if self.state != RaftState::Leader {
            return None;
        }

        let mut matched: Vec<u64> = self
            .peers
            .iter()
            .map(|peer| self.match_index.get(peer).copied().unwrap_or(0))
            .collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = *matched.get(self.cluster_size() / 2)?;
        if candidate <= self.commit_index || self.log.term_at(candidate) != Some(self.current_term) {
            return None;
        }

        self.commit_index = candidate;
        debug!(node = self.id, commit_index = candidate, "advanced commit index");
        self.apply_committed_entries();
        Some(candidate)
    }

    /// Hand every committed, unapplied entry to the apply channel, in order.
    /// Returns the number of commands delivered.
    pub fn apply_committed_entries(&mut self) -> usize {
        let mut delivered = 0;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index) else {
                break;
            };
            self.last_applied = index;

            if let Some(command) = &entry.command {
                let committed = CommittedEntry {
                    index,
                    term: entry.term,
                    command: command.clone(),
                };
                if self.apply_tx.send(committed).is_err() {
                    debug!(node = self.id, index, "apply channel closed");
                }
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apply::{self, CommittedEntries};
    use crate::storage::file::FileStorage;
    use crate::storage::memory::MemoryStorage;
    use std::time::Duration;

    fn new_test_core(id: NodeId, peers: Vec<NodeId>) -> RaftCore {
        new_test_core_with_entries(id, peers).0
    }

    fn new_test_core_with_entries(id: NodeId, peers: Vec<NodeId>) -> (RaftCore, CommittedEntries) {
        let (apply_tx, entries) = apply::channel();
        let core = RaftCore::new(id, peers, Box::new(MemoryStorage::new()), apply_tx).unwrap();
        (core, entries)
    }

    fn entry(term: u64, index: u64, cmd: &str) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Some(cmd.as_bytes().to_vec()),
        }
    }

    fn append_args(
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id: 1,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    fn vote_args(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }

    /// Make `core` leader of `term` without the election no-op
    fn force_leader(core: &mut RaftCore, term: u64) {
        core.current_term = term;
        core.state = RaftState::Leader;
        core.current_leader = Some(core.id);
        let next = core.log.len();
        for &peer in &core.peers.clone() {
            core.next_index.insert(peer, next);
            core.match_index.insert(peer, 0);
        }
    }

    fn success(term: u64) -> AppendEntriesResult {
        AppendEntriesResult { term, success: true }
    }

    #[test]
    fn test_initial_state() {
        let core = new_test_core(1, vec![2, 3]);
        assert_eq!(core.state, RaftState::Follower);
        assert_eq!(core.current_term, 0);
        assert_eq!(core.voted_for, None);
        assert_eq!(core.log.len(), 1);
        assert_eq!(core.commit_index, 0);
        assert_eq!(core.last_applied, 0);
    }

    // === RequestVote ===

    #[test]
    fn test_request_vote_granted_on_empty_logs() {
        let mut core = new_test_core(2, vec![1, 3]);
        let result = core.handle_request_vote(&vote_args(1, 1, 0, 0)).unwrap();
        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(core.voted_for, Some(1));
    }

    #[test]
    fn test_request_vote_rejected_stale_term() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.current_term = 5;
        let result = core.handle_request_vote(&vote_args(4, 1, 10, 4)).unwrap();
        assert!(!result.vote_granted);
        assert_eq!(result.term, 5);
        assert_eq!(core.voted_for, None);
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut core = new_test_core(3, vec![1, 2]);
        assert!(core.handle_request_vote(&vote_args(1, 1, 0, 0)).unwrap().vote_granted);
        assert!(!core.handle_request_vote(&vote_args(1, 2, 0, 0)).unwrap().vote_granted);
        // Same candidate asking again is granted (lost reply)
        assert!(core.handle_request_vote(&vote_args(1, 1, 0, 0)).unwrap().vote_granted);
        // A new term frees the vote
        assert!(core.handle_request_vote(&vote_args(2, 2, 0, 0)).unwrap().vote_granted);
        assert_eq!(core.voted_for, Some(2));
    }

    #[test]
    fn test_vote_denied_for_log_with_older_last_term() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(2, 2, "b"));

        // Longer log but older last term
        let result = core.handle_request_vote(&vote_args(3, 1, 5, 1)).unwrap();
        assert!(!result.vote_granted);
        assert_eq!(result.term, 3);
    }

    #[test]
    fn test_vote_denied_for_shorter_log_same_last_term() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(1, 2, "b"));

        assert!(!core.handle_request_vote(&vote_args(2, 1, 1, 1)).unwrap().vote_granted);
        assert!(core.handle_request_vote(&vote_args(2, 1, 2, 1)).unwrap().vote_granted);
    }

    #[test]
    fn test_vote_granted_for_newer_last_term_with_shorter_log() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(1, 2, "b"));
        core.log.push(entry(1, 3, "c"));

        // Index 1 < 3, but last term 2 > 1
        let result = core.handle_request_vote(&vote_args(3, 1, 1, 2)).unwrap();
        assert!(result.vote_granted);
    }

    #[test]
    fn test_leader_steps_down_and_votes_for_higher_term() {
        let mut core = new_test_core(1, vec![2, 3, 4]);
        core.start_election().unwrap();
        core.become_leader().unwrap();
        assert_eq!(core.current_term, 1);

        // Candidate with a log as long as ours in a newer term
        let args = vote_args(2, 4, core.last_log_index(), core.last_log_term());
        let result = core.handle_request_vote(&args).unwrap();

        assert!(result.vote_granted);
        assert_eq!(result.term, 2);
        assert_eq!(core.state, RaftState::Follower);
        assert_eq!(core.current_term, 2);
        assert_eq!(core.voted_for, Some(4));
    }

    #[test]
    fn test_higher_term_clears_vote_even_when_denied() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(3, 1, "a"));
        core.handle_request_vote(&vote_args(3, 1, 1, 3)).unwrap();
        assert_eq!(core.voted_for, Some(1));

        // Newer term, but candidate's log is behind
        let result = core.handle_request_vote(&vote_args(4, 3, 0, 0)).unwrap();
        assert!(!result.vote_granted);
        assert_eq!(core.current_term, 4);
        assert_eq!(core.voted_for, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vote_grant_resets_election_timer() {
        let mut core = new_test_core(2, vec![1, 3]);
        tokio::time::advance(Duration::from_millis(140)).await;
        let before = core.election_deadline;

        core.handle_request_vote(&vote_args(1, 1, 0, 0)).unwrap();
        assert!(core.election_deadline > before);
        assert!(core.election_deadline >= Instant::now() + Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_vote_does_not_reset_election_timer() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.handle_request_vote(&vote_args(1, 1, 0, 0)).unwrap();
        let deadline = core.election_deadline;

        tokio::time::advance(Duration::from_millis(50)).await;
        core.handle_request_vote(&vote_args(1, 3, 0, 0)).unwrap();
        assert_eq!(core.election_deadline, deadline);
    }

    // === AppendEntries ===

    #[test]
    fn test_append_first_entry_after_genesis() {
        let mut core = new_test_core(2, vec![1, 3]);
        let args = append_args(1, 0, 0, vec![entry(1, 1, "SET a 1")], 0);

        let result = core.handle_append_entries(&args).unwrap();
        assert!(result.success);
        assert_eq!(core.log.len(), 2);
        assert_eq!(core.log.get(1), Some(&entry(1, 1, "SET a 1")));
        assert_eq!(core.current_leader, Some(1));
    }

    #[test]
    fn test_append_rejected_when_prev_index_beyond_log() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(1, 2, "b"));
        assert_eq!(core.log.len(), 3);

        let args = append_args(1, 5, 1, vec![entry(1, 6, "x")], 0);
        let result = core.handle_append_entries(&args).unwrap();

        assert!(!result.success);
        assert_eq!(core.log.len(), 3);
    }

    #[test]
    fn test_append_rejected_on_prev_term_mismatch() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));

        let args = append_args(2, 1, 2, vec![entry(2, 2, "b")], 0);
        let result = core.handle_append_entries(&args).unwrap();
        assert!(!result.success);
        assert_eq!(result.term, 2);
        assert_eq!(core.log.last_index(), 1);
    }

    #[test]
    fn test_append_rejected_stale_term() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.current_term = 3;

        let result = core.handle_append_entries(&append_args(2, 0, 0, vec![], 0)).unwrap();
        assert!(!result.success);
        assert_eq!(result.term, 3);
        assert_eq!(core.current_leader, None);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(1, 2, "stale b"));
        core.log.push(entry(1, 3, "stale c"));

        let args = append_args(2, 1, 1, vec![entry(2, 2, "b")], 0);
        assert!(core.handle_append_entries(&args).unwrap().success);

        assert_eq!(core.log.last_index(), 2);
        assert_eq!(core.log.get(2), Some(&entry(2, 2, "b")));
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut core = new_test_core(2, vec![1, 3]);
        let args = append_args(1, 0, 0, vec![entry(1, 1, "a"), entry(1, 2, "b")], 0);

        assert!(core.handle_append_entries(&args).unwrap().success);
        assert!(core.handle_append_entries(&args).unwrap().success);
        assert_eq!(core.log.last_index(), 2);
    }

    #[test]
    fn test_stale_append_keeps_matching_suffix() {
        let mut core = new_test_core(2, vec![1, 3]);
        let full = append_args(1, 0, 0, vec![entry(1, 1, "a"), entry(1, 2, "b"), entry(1, 3, "c")], 0);
        core.handle_append_entries(&full).unwrap();

        // A delayed, shorter request from the same leader
        let delayed = append_args(1, 0, 0, vec![entry(1, 1, "a")], 0);
        assert!(core.handle_append_entries(&delayed).unwrap().success);
        assert_eq!(core.log.last_index(), 3);
    }

    #[test]
    fn test_append_rejects_non_contiguous_entries() {
        let mut core = new_test_core(2, vec![1, 3]);
        let args = append_args(1, 0, 0, vec![entry(1, 1, "a"), entry(1, 3, "c")], 0);
        assert!(!core.handle_append_entries(&args).unwrap().success);
        assert_eq!(core.log.last_index(), 0);
    }

    #[test]
    fn test_commit_limited_to_last_new_entry() {
        let (mut core, mut committed) = new_test_core_with_entries(2, vec![1, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(1, 2, "b"));
        core.log.push(entry(1, 3, "unverified"));

        // Leader has committed up to 10 but this request only proves index 2
        let args = append_args(1, 1, 1, vec![entry(1, 2, "b")], 10);
        assert!(core.handle_append_entries(&args).unwrap().success);

        assert_eq!(core.commit_index, 2);
        let applied: Vec<u64> = committed.drain().iter().map(|e| e.index).collect();
        assert_eq!(applied, vec![1, 2]);
    }

    #[test]
    fn test_commit_index_never_decreases() {
        let mut core = new_test_core(2, vec![1, 3]);
        let args = append_args(1, 0, 0, vec![entry(1, 1, "a"), entry(1, 2, "b")], 2);
        core.handle_append_entries(&args).unwrap();
        assert_eq!(core.commit_index, 2);

        // Heartbeat whose prev is behind our commit point
        let heartbeat = append_args(1, 1, 1, vec![], 3);
        core.handle_append_entries(&heartbeat).unwrap();
        assert_eq!(core.commit_index, 2);
    }

    #[test]
    fn test_candidate_steps_down_on_append_same_term() {
        let mut core = new_test_core(2, vec![1, 3]);
        core.start_election().unwrap();
        assert_eq!(core.state, RaftState::Candidate);

        let result = core.handle_append_entries(&append_args(1, 0, 0, vec![], 0)).unwrap();
        assert!(result.success);
        assert_eq!(core.state, RaftState::Follower);
        assert_eq!(core.current_term, 1);
        // Same term, so our own vote stands
        assert_eq!(core.voted_for, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_resets_election_timer() {
        let mut core = new_test_core(2, vec![1, 3]);
        tokio::time::advance(Duration::from_millis(140)).await;
        core.handle_append_entries(&append_args(1, 0, 0, vec![], 0)).unwrap();
        assert!(core.election_deadline >= Instant::now() + Duration::from_millis(150));
    }

    // === Election ===

    #[test]
    fn test_start_election() {
        let mut core = new_test_core(1, vec![2, 3]);
        let won = core.start_election().unwrap();

        assert!(!won);
        assert_eq!(core.state, RaftState::Candidate);
        assert_eq!(core.current_term, 1);
        assert_eq!(core.voted_for, Some(1));
        assert_eq!(core.request_vote_args(), vote_args(1, 1, 0, 0));
    }

    #[test]
    fn test_single_node_wins_immediately() {
        let mut core = new_test_core(1, vec![]);
        assert!(core.start_election().unwrap());
        assert_eq!(core.state, RaftState::Leader);

        // Commands commit as soon as they are appended
        let appended = core.append_log_entry(b"SET a 1".to_vec()).unwrap().unwrap();
        assert_eq!(core.commit_index, appended.index);
    }

    #[test]
    fn test_three_node_election_wins_with_two_votes() {
        let mut core = new_test_core(1, vec![2, 3]);
        core.start_election().unwrap();

        let grant = RequestVoteResult { term: 1, vote_granted: true };
        assert!(core.handle_request_vote_result(2, 1, &grant).unwrap());
        assert_eq!(core.state, RaftState::Leader);
    }

    #[test]
    fn test_duplicate_votes_counted_once() {
        let mut core = new_test_core(1, vec![2, 3, 4, 5]);
        core.start_election().unwrap();

        let grant = RequestVoteResult { term: 1, vote_granted: true };
        assert!(!core.handle_request_vote_result(2, 1, &grant).unwrap());
        assert!(!core.handle_request_vote_result(2, 1, &grant).unwrap());
        assert_eq!(core.state, RaftState::Candidate);
        assert!(core.handle_request_vote_result(3, 1, &grant).unwrap());
    }

    #[test]
    fn test_vote_from_previous_election_ignored() {
        let mut core = new_test_core(1, vec![2, 3]);
        core.start_election().unwrap();
        core.start_election().unwrap();
        assert_eq!(core.current_term, 2);

        let old_grant = RequestVoteResult { term: 1, vote_granted: true };
        assert!(!core.handle_request_vote_result(2, 1, &old_grant).unwrap());
        assert_eq!(core.state, RaftState::Candidate);
    }

    #[test]
    fn test_vote_reply_with_higher_term_steps_down() {
        let mut core = new_test_core(1, vec![2, 3]);
        core.start_election().unwrap();

        let reply = RequestVoteResult { term: 5, vote_granted: false };
        assert!(!core.handle_request_vote_result(2, 1, &reply).unwrap());
        assert_eq!(core.state, RaftState::Follower);
        assert_eq!(core.current_term, 5);
        assert_eq!(core.voted_for, None);
    }

    #[test]
    fn test_become_leader_initializes_indices_and_appends_noop() {
        let mut core = new_test_core(1, vec![2, 3]);
        core.log.push(entry(1, 1, "a"));
        core.current_term = 1;
        core.start_election().unwrap();
        core.become_leader().unwrap();

        assert_eq!(core.next_index.get(&2), Some(&2));
        assert_eq!(core.match_index.get(&3), Some(&0));
        let noop = core.log.get(2).unwrap();
        assert_eq!(noop.term, 2);
        assert_eq!(noop.command, None);

        // First request to a peer carries the no-op
        let args = core.append_entries_for(2, 2).unwrap();
        assert_eq!(args.prev_log_index, 1);
        assert_eq!(args.prev_log_term, 1);
        assert_eq!(args.entries.len(), 1);
    }

    #[test]
    fn test_append_log_entry_requires_leader() {
        let mut core = new_test_core(1, vec![2, 3]);
        assert!(core.append_log_entry(b"x".to_vec()).unwrap().is_none());
        assert_eq!(core.log.len(), 1);
    }

    // === Replication results and commit ===

    #[test]
    fn test_append_entries_for_wrong_term_is_none() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 2);
        assert!(core.append_entries_for(2, 1).is_none());
        assert!(core.append_entries_for(2, 2).is_some());
    }

    #[test]
    fn test_success_updates_next_and_match_index() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 1);
        core.append_log_entry(b"a".to_vec()).unwrap();
        core.append_log_entry(b"b".to_vec()).unwrap();

        let args = core.append_entries_for(2, 1).unwrap();
        assert_eq!(args.entries.len(), 2);

        let progress = core
            .handle_append_entries_result(2, 1, args.prev_log_index, args.entries.len(), &success(1))
            .unwrap();
        assert_eq!(progress, ReplicationProgress::UpToDate);
        assert_eq!(core.next_index.get(&2), Some(&3));
        assert_eq!(core.match_index.get(&2), Some(&2));
    }

    #[test]
    fn test_success_reports_catching_up_when_log_grew() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 1);
        core.append_log_entry(b"a".to_vec()).unwrap();
        let args = core.append_entries_for(2, 1).unwrap();
        core.append_log_entry(b"b".to_vec()).unwrap();

        let progress = core
            .handle_append_entries_result(2, 1, args.prev_log_index, args.entries.len(), &success(1))
            .unwrap();
        assert_eq!(progress, ReplicationProgress::CatchingUp);
    }

    #[test]
    fn test_mismatch_backtracks_one_entry_with_floor() {
        let mut core = new_test_core(1, vec![2, 3]);
        core.log.push(entry(1, 1, "a"));
        core.log.push(entry(1, 2, "b"));
        force_leader(&mut core, 2);
        let reject = AppendEntriesResult { term: 2, success: false };

        assert_eq!(core.next_index.get(&2), Some(&3));
        let progress = core.handle_append_entries_result(2, 2, 2, 0, &reject).unwrap();
        assert_eq!(progress, ReplicationProgress::Backtrack);
        assert_eq!(core.next_index.get(&2), Some(&2));

        core.handle_append_entries_result(2, 2, 1, 1, &reject).unwrap();
        assert_eq!(core.next_index.get(&2), Some(&1));

        // Cannot go below the entry after genesis
        let progress = core.handle_append_entries_result(2, 2, 0, 2, &reject).unwrap();
        assert_eq!(progress, ReplicationProgress::Stale);
        assert_eq!(core.next_index.get(&2), Some(&1));
    }

    #[test]
    fn test_match_index_never_decreases() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 1);
        for cmd in ["a", "b", "c"] {
            core.append_log_entry(cmd.as_bytes().to_vec()).unwrap();
        }

        core.handle_append_entries_result(2, 1, 0, 3, &success(1)).unwrap();
        assert_eq!(core.match_index.get(&2), Some(&3));

        // Reply to an older, shorter request
        core.handle_append_entries_result(2, 1, 0, 1, &success(1)).unwrap();
        assert_eq!(core.match_index.get(&2), Some(&3));
    }

    #[test]
    fn test_shorter_success_does_not_rewind_next_index() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 1);
        for cmd in ["a", "b", "c"] {
            core.append_log_entry(cmd.as_bytes().to_vec()).unwrap();
        }

        let progress = core.handle_append_entries_result(2, 1, 0, 3, &success(1)).unwrap();
        assert_eq!(progress, ReplicationProgress::UpToDate);
        assert_eq!(core.next_index.get(&2), Some(&4));

        // A shorter request answered late must not cause entries 2..=3 to be resent
        core.handle_append_entries_result(2, 1, 0, 1, &success(1)).unwrap();
        assert_eq!(core.next_index.get(&2), Some(&4));
        assert_eq!(core.append_entries_for(2, 1).unwrap().entries.len(), 0);
    }

    #[test]
    fn test_reply_with_higher_term_steps_leader_down() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 1);
        let reply = AppendEntriesResult { term: 4, success: false };

        let progress = core.handle_append_entries_result(2, 1, 0, 0, &reply).unwrap();
        assert_eq!(progress, ReplicationProgress::SteppedDown);
        assert_eq!(core.state, RaftState::Follower);
        assert_eq!(core.current_term, 4);
        assert_eq!(core.voted_for, None);
    }

    #[test]
    fn test_majority_commit_applies_in_order() {
        let (mut core, mut committed) = new_test_core_with_entries(1, vec![2, 3]);
        core.log.push(entry(2, 1, "SET a 1"));
        core.log.push(entry(3, 2, "SET b 2"));
        force_leader(&mut core, 3);
        core.next_index.insert(2, 1);

        let args = core.append_entries_for(2, 3).unwrap();
        assert_eq!(args.entries.len(), 2);
        core.handle_append_entries_result(2, 3, 0, 2, &success(3)).unwrap();

        assert_eq!(core.commit_index, 2);
        assert_eq!(core.last_applied, 2);
        let applied = committed.drain();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].index, 1);
        assert_eq!(applied[0].command, b"SET a 1".to_vec());
        assert_eq!(applied[1].index, 2);
        assert_eq!(applied[1].term, 3);
    }

    #[test]
    fn test_previous_term_entries_not_committed_by_count() {
        let mut core = new_test_core(1, vec![2, 3]);
        core.log.push(entry(1, 1, "old"));
        force_leader(&mut core, 2);

        // Replicated to a majority, but from term 1
        core.handle_append_entries_result(2, 2, 0, 1, &success(2)).unwrap();
        assert_eq!(core.commit_index, 0);

        // A current-term entry commits it indirectly
        core.append_log_entry(b"new".to_vec()).unwrap();
        core.handle_append_entries_result(2, 2, 1, 1, &success(2)).unwrap();
        assert_eq!(core.commit_index, 2);
    }

    #[test]
    fn test_two_node_cluster_needs_both() {
        let mut core = new_test_core(1, vec![2]);
        force_leader(&mut core, 1);
        core.append_log_entry(b"a".to_vec()).unwrap();
        assert_eq!(core.commit_index, 0);

        core.handle_append_entries_result(2, 1, 0, 1, &success(1)).unwrap();
        assert_eq!(core.commit_index, 1);
    }

    #[test]
    fn test_four_node_cluster_needs_three() {
        let mut core = new_test_core(1, vec![2, 3, 4]);
        force_leader(&mut core, 1);
        core.append_log_entry(b"a".to_vec()).unwrap();

        core.handle_append_entries_result(2, 1, 0, 1, &success(1)).unwrap();
        assert_eq!(core.commit_index, 0);
        core.handle_append_entries_result(3, 1, 0, 1, &success(1)).unwrap();
        assert_eq!(core.commit_index, 1);
    }

    #[test]
    fn test_five_node_cluster_commits_highest_majority_index() {
        let mut core = new_test_core(1, vec![2, 3, 4, 5]);
        force_leader(&mut core, 1);
        for cmd in ["a", "b", "c"] {
            core.append_log_entry(cmd.as_bytes().to_vec()).unwrap();
        }

        core.handle_append_entries_result(2, 1, 0, 3, &success(1)).unwrap();
        core.handle_append_entries_result(3, 1, 0, 2, &success(1)).unwrap();
        // Leader 3, peer2 3, peer3 2: index 2 is on three of five
        assert_eq!(core.commit_index, 2);
    }

    #[test]
    fn test_stale_reply_after_step_down_ignored() {
        let mut core = new_test_core(1, vec![2, 3]);
        force_leader(&mut core, 1);
        core.append_log_entry(b"a".to_vec()).unwrap();
        core.handle_append_entries(&append_args(2, 0, 0, vec![], 0)).unwrap();
        assert_eq!(core.state, RaftState::Follower);

        let progress = core.handle_append_entries_result(2, 1, 0, 1, &success(1)).unwrap();
        assert_eq!(progress, ReplicationProgress::Stale);
        assert_eq!(core.commit_index, 0);
    }

    #[test]
    fn test_noop_advances_last_applied_without_delivery() {
        let (mut core, mut committed) = new_test_core_with_entries(1, vec![]);
        core.start_election().unwrap();
        assert_eq!(core.commit_index, 1);
        assert_eq!(core.last_applied, 1);
        assert!(committed.try_next().is_none());

        core.append_log_entry(b"cmd".to_vec()).unwrap();
        assert_eq!(committed.try_next().unwrap().index, 2);
    }

    #[test]
    fn test_follower_applies_each_entry_once() {
        let (mut core, mut committed) = new_test_core_with_entries(2, vec![1, 3]);
        let args = append_args(1, 0, 0, vec![entry(1, 1, "a"), entry(1, 2, "b")], 1);
        core.handle_append_entries(&args).unwrap();
        core.handle_append_entries(&args).unwrap();

        let heartbeat = append_args(1, 2, 1, vec![], 2);
        core.handle_append_entries(&heartbeat).unwrap();
        core.handle_append_entries(&heartbeat).unwrap();

        let applied: Vec<u64> = committed.drain().iter().map(|e| e.index).collect();
        assert_eq!(applied, vec![1, 2]);
    }

    // === Persistence ===

    #[test]
    fn test_state_restored_after_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let (apply_tx, _entries) = apply::channel();
            let storage = FileStorage::new(dir.path()).unwrap();
            let mut core = RaftCore::new(2, vec![1, 3], Box::new(storage), apply_tx).unwrap();
            core.handle_request_vote(&vote_args(3, 1, 0, 0)).unwrap();
            let args = append_args(3, 0, 0, vec![entry(3, 1, "a"), entry(3, 2, "b")], 0);
            core.handle_append_entries(&args).unwrap();
            // Conflicting suffix replaced by a newer leader
            let args = append_args(4, 1, 3, vec![entry(4, 2, "c")], 0);
            core.handle_append_entries(&args).unwrap();
        }

        let (apply_tx, _entries) = apply::channel();
        let storage = FileStorage::new(dir.path()).unwrap();
        let core = RaftCore::new(2, vec![1, 3], Box::new(storage), apply_tx).unwrap();
        assert_eq!(core.current_term, 4);
        assert_eq!(core.voted_for, None);
        assert_eq!(core.log.last_index(), 2);
        assert_eq!(core.log.get(2), Some(&entry(4, 2, "c")));
        // Volatile state starts over
        assert_eq!(core.commit_index, 0);
        assert_eq!(core.state, RaftState::Follower);
    }

    #[test]
    fn test_vote_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let (apply_tx, _entries) = apply::channel();
            let storage = FileStorage::new(dir.path()).unwrap();
            let mut core = RaftCore::new(3, vec![1, 2], Box::new(storage), apply_tx).unwrap();
            assert!(core.handle_request_vote(&vote_args(1, 1, 0, 0)).unwrap().vote_granted);
        }

        let (apply_tx, _entries) = apply::channel();
        let storage = FileStorage::new(dir.path()).unwrap();
        let mut core = RaftCore::new(3, vec![1, 2], Box::new(storage), apply_tx).unwrap();
        assert!(!core.handle_request_vote(&vote_args(1, 2, 0, 0)).unwrap().vote_granted);
    }
}
