//! Simple key-value store state machine
//!
//! Commands (UTF-8, state-changing operations that go through Raft):
//! - `SET key value` - Set a key to a value, returns Ok("")
//! - `DELETE key` - Delete a key, returns Ok("") or Err("NOT_FOUND")
//!
//! For reads, use the `get()` method directly (bypasses Raft log).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{ApplyResult, StateMachine};

/// Simple in-memory key-value store
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value directly (for read-only queries, bypasses Raft)
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Get all key-value pairs
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

/// Shared key-value store, written by the apply loop and read by the API
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.lock().unwrap_or_else(PoisonError::into_inner).apply(command)
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        let command = std::str::from_utf8(command).map_err(|_| "command is not UTF-8".to_string())?;
        let parts: Vec<&str> = command.splitn(3, ' ').collect();

        match parts.as_slice() {
            ["SET", key, value] => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(String::new())
            }
            ["DELETE", key] => {
                if self.data.remove(*key).is_some() {
                    Ok(String::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
            _ => Err(format!("unknown command: {}", command)),
        }
    }
}
