//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RequestVoteArgs, RequestVoteResult,
};

/// Transport abstraction for Raft RPC communication
///
/// Calls may fail, time out, or be delivered late; the consensus layer
/// treats every error as "no reply".
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("unknown node")]
    NodeNotFound,
}
