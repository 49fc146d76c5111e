//! HTTP transport implementation for Raft RPC
//!
//! Uses axum for the server and reqwest for the client. Each RPC is a JSON
//! POST to `/raft/<rpc>`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// HTTP transport for Raft RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<NodeId, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses and a per-request timeout
    pub fn new(peers: HashMap<NodeId, String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTransport { peers, client })
    }

    async fn post<A: Serialize, R: DeserializeOwned>(
        &self,
        target: NodeId,
        rpc: &str,
        args: &A,
    ) -> Result<R, TransportError> {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/raft/{}", addr, rpc);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        // A peer that failed to persist answers 500; treat it as no reply
        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed);
        }

        response
            .json::<R>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post(target, "request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post(target, "append_entries", &args).await
    }
}

/// Create an axum router for handling Raft RPCs
pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .with_state(core)
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> Result<Json<RequestVoteResult>, StatusCode> {
    let mut core = core.lock().await;
    core.handle_request_vote(&args).map(Json).map_err(|e| {
        error!(node = core.id, error = %e, "failed to persist vote");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> Result<Json<AppendEntriesResult>, StatusCode> {
    let mut core = core.lock().await;
    core.handle_append_entries(&args).map(Json).map_err(|e| {
        error!(node = core.id, error = %e, "failed to persist entries");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
