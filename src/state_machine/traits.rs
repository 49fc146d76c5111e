//! State machine abstraction for Raft
//!
//! The state machine is the application logic that Raft coordinates.
//! Committed commands reach it through `run_apply_loop`.

use std::sync::{Arc, Mutex, PoisonError};

/// Result of applying a command to the state machine
/// Ok(output) for successful commands, Err(message) for errors
pub type ApplyResult = Result<String, String>;

/// State machine trait - the application logic that Raft coordinates
///
/// Implementations must be deterministic: applying the same commands
/// in the same order must produce the same state on all nodes.
pub trait StateMachine: Send {
    /// Apply a committed command
    fn apply(&mut self, command: &[u8]) -> ApplyResult;
}

/// Shared record of applied commands for testing
pub type AppliedCommands = Arc<Mutex<Vec<Vec<u8>>>>;

/// Test state machine that records all applied commands to a shared vec
#[derive(Default)]
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a shared vec to inspect applied commands from outside
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_vec());
        Ok(String::new())
    }
}
