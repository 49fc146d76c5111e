//! State machine layer for Raft
//!
//! - `KeyValueStore`: Simple key-value store
//! - `TestStateMachine`: Records commands for testing

pub mod kv;
pub mod traits;

pub use kv::{KeyValueStore, SharedKvStore};
pub use traits::{AppliedCommands, ApplyResult, StateMachine, TestStateMachine};

use tracing::debug;

use crate::core::apply::CommittedEntries;

/// Feed committed entries to `state_machine` in order until the stream ends.
/// Rejected commands are logged and skipped; every node rejects them alike.
pub async fn run_apply_loop<S: StateMachine>(mut entries: CommittedEntries, mut state_machine: S) {
    while let Some(entry) = entries.next().await {
        match state_machine.apply(&entry.command) {
            Ok(_) => debug!(index = entry.index, "applied command"),
            Err(e) => debug!(index = entry.index, error = %e, "command rejected"),
        }
    }
}
