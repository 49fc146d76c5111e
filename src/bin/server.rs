//! Raft key-value server
//!
//! Runs a single node with separate listeners for cluster transport and client API.
//!
//! Example for a 3-node cluster:
//!   raftkv-server --id 1 --listen 127.0.0.1:8001 --api-listen 127.0.0.1:9001 --peer 2=127.0.0.1:8002 --peer 3=127.0.0.1:8003
//!   raftkv-server --id 2 --listen 127.0.0.1:8002 --api-listen 127.0.0.1:9002 --peer 1=127.0.0.1:8001 --peer 3=127.0.0.1:8003
//!   raftkv-server --id 3 --listen 127.0.0.1:8003 --api-listen 127.0.0.1:9003 --peer 1=127.0.0.1:8001 --peer 2=127.0.0.1:8002

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftkv::api::create_client_router;
use raftkv::core::apply;
use raftkv::core::{NodeId, RaftConfig, RaftCore, RaftServer};
use raftkv::state_machine::{run_apply_loop, SharedKvStore};
use raftkv::storage::file::FileStorage;
use raftkv::storage::memory::MemoryStorage;
use raftkv::storage::Storage;
use raftkv::transport::http::{create_router, HttpTransport};

#[derive(Parser, Debug)]
#[command(name = "raftkv-server", about = "Run one node of a Raft key-value cluster")]
struct Args {
    /// This node's id
    #[arg(long)]
    id: NodeId,

    /// Address for Raft RPC (/raft/*)
    #[arg(long)]
    listen: SocketAddr,

    /// Address for the client API (/client/*)
    #[arg(long)]
    api_listen: SocketAddr,

    /// A peer as id=host:port, repeatable
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, String)>,

    /// Directory for durable state. Memory storage if omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,

    /// Per-RPC timeout
    #[arg(long, default_value_t = 500)]
    rpc_timeout_ms: u64,
}

fn parse_peer(s: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {s:?}"))?;
    let id = id.parse().map_err(|e| format!("invalid peer id {id:?}: {e}"))?;
    if addr.is_empty() {
        return Err(format!("missing address for peer {id}"));
    }
    Ok((id, addr.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_election_timeout(
            Duration::from_millis(args.election_min_ms),
            Duration::from_millis(args.election_max_ms),
        );

    let storage: Box<dyn Storage> = match &args.data_dir {
        Some(dir) => {
            info!(node = args.id, dir = %dir.display(), "using file storage");
            Box::new(FileStorage::new(dir)?)
        }
        None => {
            info!(node = args.id, "using memory storage, state is lost on exit");
            Box::new(MemoryStorage::new())
        }
    };

    let peers: HashMap<NodeId, String> = args.peers.into_iter().collect();
    let peer_ids: Vec<NodeId> = peers.keys().copied().collect();
    info!(node = args.id, ?peers, "starting");

    let kv_store = SharedKvStore::default();
    let (apply_tx, committed) = apply::channel();
    tokio::spawn(run_apply_loop(committed, kv_store.clone()));

    let transport = HttpTransport::new(peers, Duration::from_millis(args.rpc_timeout_ms))?;
    let core = RaftCore::new(args.id, peer_ids, storage, apply_tx)?;
    let (server, shared_core) = RaftServer::with_config(core, transport, config);
    let raft_handle = server.start();

    let raft_router = create_router(shared_core);
    let client_router = create_client_router(raft_handle, kv_store);

    let transport_listener = TcpListener::bind(args.listen).await?;
    info!(node = args.id, addr = %args.listen, "raft transport listening");
    let transport_server = tokio::spawn(async move { axum::serve(transport_listener, raft_router).await });

    let api_listener = TcpListener::bind(args.api_listen).await?;
    info!(node = args.id, addr = %args.api_listen, "client api listening");
    axum::serve(api_listener, client_router).await?;

    transport_server.await??;
    Ok(())
}
