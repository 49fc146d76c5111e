//! Storage abstraction for Raft persistent state
//!
//! Raft requires certain state to be persisted to stable storage before
//! responding to RPCs: current_term, voted_for, and log entries.
//!
//! - `MemoryStorage`: in-memory, for tests
//! - `FileStorage`: file-based storage with CRC32 checksums

pub mod file;
pub mod memory;

use crate::core::log::LogEntry;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Checksum mismatch or malformed record
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Storage trait for Raft persistent state
///
/// Implementations must ensure durability: a call that returns `Ok` must
/// survive a crash. The genesis entry is never stored; the persisted log
/// starts at index 1.
pub trait Storage: Send {
    /// Returns 0 on a fresh start
    fn load_term(&self) -> Result<u64, StorageError>;

    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError>;

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// Load all log entries after genesis, in index order
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing entries
    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index >= from_index
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;
}
