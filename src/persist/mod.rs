//! Persistence
//!
//! Durable copies of the in-memory state. Nothing here is on the request
//! path: snapshots are written by the server's flush task and placements
//! reach the journal through a queue.
//!
//! ## Module Structure
//!
//! - `snapshot`: checksummed canvas + chat snapshots, atomically replaced
//! - `journal`: append-only placement history

pub mod journal;
pub mod snapshot;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use journal::{PlacementJournal, PlacementRecord};
pub use snapshot::{CanvasSnapshot, SnapshotStore, StoredCell, StoredChat};

/// Snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "canvas.snap";

/// Journal file name inside the data directory.
pub const JOURNAL_FILE: &str = "placements.jsonl";

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot payload could not be encoded or decoded.
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Journal line could not be encoded or decoded.
    #[error("journal encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot failed validation and was moved aside.
    #[error("corrupted snapshot ({reason}), moved to {quarantined}")]
    Corrupted {
        /// What failed.
        reason: String,
        /// Where the bad file now lives.
        quarantined: PathBuf,
    },

    /// Journal writer task has stopped.
    #[error("journal writer stopped")]
    JournalClosed,
}

/// Persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    /// Data directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// How often the flush task checks for changes.
    pub flush_interval: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl PersistConfig {
    /// Snapshot path, when persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(SNAPSHOT_FILE))
    }

    /// Journal path, when persistence is enabled.
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(JOURNAL_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_data_dir() {
        let config = PersistConfig::default();
        assert!(config.snapshot_path().is_none());
        assert!(config.journal_path().is_none());

        let config = PersistConfig {
            data_dir: Some(PathBuf::from("/var/lib/canvas")),
            ..PersistConfig::default()
        };
        assert_eq!(config.snapshot_path(), Some(PathBuf::from("/var/lib/canvas/canvas.snap")));
        assert_eq!(config.journal_path(), Some(PathBuf::from("/var/lib/canvas/placements.jsonl")));
    }
}
