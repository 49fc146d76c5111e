//! File-based storage for Raft persistent state
//!
//! Two files live in the data directory:
//! - `hard_state`: `{"term":..,"voted_for":..}` followed by a checksum,
//!   replaced atomically (write temp, fsync, rename)
//! - `log`: one JSON entry per line, each followed by its checksum,
//!   appended and fsynced
//!
//! Checksums catch torn or corrupted writes when the node restarts.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Storage, StorageError};
use crate::core::log::LogEntry;

/// CRC32 (IEEE polynomial)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// Format a record as `"{data} {crc32_hex}"`
fn seal(data: &str) -> String {
    format!("{} {:08x}", data, crc32(data.as_bytes()))
}

/// Verify a sealed record and return its data portion
fn unseal<'a>(record: &'a str, what: &str) -> Result<&'a str, StorageError> {
    let (data, checksum) = record
        .rsplit_once(' ')
        .ok_or_else(|| StorageError::Corruption(format!("{}: missing checksum", what)))?;

    let stored = u32::from_str_radix(checksum, 16)
        .map_err(|_| StorageError::Corruption(format!("{}: invalid checksum format", what)))?;
    let computed = crc32(data.as_bytes());
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "{}: checksum mismatch, stored {:08x}, computed {:08x}",
            what, stored, computed
        )));
    }
    Ok(data)
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct HardState {
    term: u64,
    voted_for: Option<u64>,
}

/// File-based storage rooted at a directory
pub struct FileStorage {
    dir: PathBuf,
    hard_state: HardState,
}

impl FileStorage {
    /// Open (or create) storage in `dir`, validating the stored term and vote
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut storage = FileStorage {
            dir,
            hard_state: HardState::default(),
        };
        storage.hard_state = storage.read_hard_state()?;
        Ok(storage)
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join("hard_state")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn read_hard_state(&self) -> Result<HardState, StorageError> {
        let path = self.hard_state_path();
        if !path.exists() {
            return Ok(HardState::default());
        }
        let content = fs::read_to_string(&path)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(HardState::default());
        }
        let json = unseal(content, "hard_state")?;
        serde_json::from_str(json)
            .map_err(|e| StorageError::Corruption(format!("hard_state: {}", e)))
    }

    fn write_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError> {
        let json = serde_json::to_string(&hard_state)?;
        let record = format!("{}\n", seal(&json));
        self.atomic_write(&self.hard_state_path(), record.as_bytes())?;
        self.hard_state = hard_state;
        Ok(())
    }

    /// Write to a temp file, fsync, then rename over the target
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        Ok(self.hard_state.term)
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        let hard_state = HardState {
            term,
            ..self.hard_state
        };
        self.write_hard_state(hard_state)
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.hard_state.voted_for)
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        let hard_state = HardState {
            voted_for,
            ..self.hard_state
        };
        self.write_hard_state(hard_state)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let what = format!("log line {}", line_num + 1);
            let json = unseal(&line, &what)?;
            let entry: LogEntry = serde_json::from_str(json)
                .map_err(|e| StorageError::Corruption(format!("{}: {}", what, e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;

        let mut content = String::new();
        for entry in entries {
            content.push_str(&seal(&serde_json::to_string(entry)?));
            content.push('\n');
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        let entries = self.load_log()?;
        if entries.iter().all(|e| e.index < from_index) {
            return Ok(());
        }

        let mut content = String::new();
        for entry in entries.iter().filter(|e| e.index < from_index) {
            content.push_str(&seal(&serde_json::to_string(entry)?));
            content.push('\n');
        }
        self.atomic_write(&self.log_path(), content.as_bytes())
    }
}
