//! Raft consensus core for a replicated key-value store
//!
//! - `core`: leader election, log replication and commitment
//! - `storage`: durable term, vote and log
//! - `transport`: RPC between nodes (HTTP or in-memory channels)
//! - `state_machine`: key-value store fed by the committed-entry stream
//! - `api`: client HTTP endpoints

pub mod api;
pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
