//! Raft consensus core
//!
//! - `raft_core`: sync state machine for the protocol rules
//! - `raft_node`: async elections and replication over a `Transport`
//! - `raft_server`: event loop, timers and the client-facing handle

pub mod apply;
pub mod config;
pub mod log;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;

pub use apply::{CommittedEntries, CommittedEntry};
pub use config::RaftConfig;
pub use log::LogEntry;
pub use raft_core::{NodeId, RaftCore, RaftState, Status};
pub use raft_node::{RaftNode, SharedCore};
pub use raft_server::{Proposal, RaftError, RaftHandle, RaftServer};
