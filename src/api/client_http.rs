//! HTTP client API for a Raft node
//!
//! - `POST /client/submit` appends a command on the leader
//! - `GET /client/get/:key` reads the local key-value store (not linearizable)
//! - `GET /client/status` reports role, term and indices

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::raft_core::{NodeId, Status};
use crate::core::raft_server::{Proposal, RaftError, RaftHandle};
use crate::state_machine::SharedKvStore;

/// State for client HTTP handlers
#[derive(Clone)]
pub struct ClientState {
    /// Handle for submitting commands and reading status
    pub handle: RaftHandle,
    /// Local replica of the key-value store, fed by the apply loop
    pub kv: SharedKvStore,
}

/// Request body for submitting a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// The command to submit (e.g., "SET key value")
    pub command: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub key: String,
    pub value: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, leader_hint: Option<NodeId>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            leader_hint,
        }),
    )
}

/// Create an axum router for the client HTTP API
pub fn create_client_router(handle: RaftHandle, kv: SharedKvStore) -> Router {
    let state = ClientState { handle, kv };
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/get/:key", get(handle_get))
        .route("/client/status", get(handle_status))
        .with_state(state)
}

/// Handle POST /client/submit. Responds once the entry is in the leader's
/// log; commit is observed through the apply stream.
pub async fn handle_submit(
    State(state): State<ClientState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<Proposal>, ApiError> {
    match state.handle.submit(request.command.into_bytes()).await {
        Ok(proposal) => Ok(Json(proposal)),
        Err(RaftError::NotLeader { leader_hint }) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Not the leader",
            leader_hint,
        )),
        Err(RaftError::Shutdown) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Node is shutting down",
            None,
        )),
        Err(RaftError::Storage(e)) => {
            error!(error = %e, "submit failed to persist");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Storage failure", None))
        }
    }
}

/// Handle GET /client/get/:key
pub async fn handle_get(
    State(state): State<ClientState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>, ApiError> {
    let value = state
        .kv
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(&key);
    match value {
        Some(value) => Ok(Json(GetResponse { key, value })),
        None => Err(api_error(StatusCode::NOT_FOUND, "Key not found", None)),
    }
}

/// Handle GET /client/status
pub async fn handle_status(State(state): State<ClientState>) -> Json<Status> {
    Json(state.handle.status().await)
}
