//! Replicated log
//!
//! Position 0 always holds a genesis entry (term 0, no command), so an
//! entry's index is also its position in the backing vector. Every lookup is
//! bound-checked and returns `Option`; callers treat `None` as a rejection.

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was created by a leader
    pub term: u64,
    /// Position in the log (genesis is 0)
    pub index: u64,
    /// Opaque client command. `None` for the genesis entry and leader no-ops.
    pub command: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn genesis() -> Self {
        LogEntry {
            term: 0,
            index: 0,
            command: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Create a log holding only the genesis entry
    pub fn new() -> Self {
        Log {
            entries: vec![LogEntry::genesis()],
        }
    }

    /// Rebuild a log from persisted entries (everything after genesis).
    /// Indices must be contiguous starting at 1.
    pub fn restore(persisted: Vec<LogEntry>) -> Result<Self, StorageError> {
        let mut log = Log::new();
        for entry in persisted {
            if entry.index != log.len() {
                return Err(StorageError::Corruption(format!(
                    "log gap: expected index {}, found {}",
                    log.len(),
                    entry.index
                )));
            }
            if entry.term < log.last_term() {
                return Err(StorageError::Corruption(format!(
                    "term went backwards at index {}",
                    entry.index
                )));
            }
            log.entries.push(entry);
        }
        Ok(log)
    }

    /// Number of entries including genesis
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Always false; genesis is never removed
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn last_index(&self) -> u64 {
        self.len() - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        usize::try_from(index).ok().and_then(|pos| self.entries.get(pos))
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// True if the log holds an entry at `index` with term `term`
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Clone every entry from `index` to the end (empty if past the end)
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = usize::try_from(index).unwrap_or(usize::MAX);
        self.entries.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Append an entry; its index must equal `len()`
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.len(), "log entries must be contiguous");
        self.entries.push(entry);
    }

    /// Drop every entry with index >= `index`. Genesis is kept.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.max(1);
        if keep < self.len() {
            self.entries.truncate(keep as usize);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
