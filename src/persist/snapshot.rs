//! Canvas Snapshots
//!
//! A snapshot is the whole canvas plus the retained chat, written as one
//! file:
//!
//! ```text
//! ┌───────────────────┬──────────────────┬──────────────────────────┐
//! │ Magic (4 bytes)   │ Version (1 byte) │ SHA-256 of payload (32)  │
//! ├───────────────────┴──────────────────┴──────────────────────────┤
//! │ Payload (bincode CanvasSnapshot)                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Saves go to a temp file that is renamed over the old snapshot, so a
//! crash mid-write leaves the previous snapshot intact. A file that fails
//! validation on load is renamed aside instead of being overwritten.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PersistError;
use crate::canvas::chat::{ChatLog, ChatMessage};
use crate::canvas::store::{CanvasStore, Cell};
use crate::core::color::Color;
use crate::core::hash::{hash_with_domain, CanvasHash, SNAPSHOT_DOMAIN};
use crate::core::identity::Identity;

/// Magic bytes ("PXCS").
const SNAPSHOT_MAGIC: [u8; 4] = *b"PXCS";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Magic + version + checksum.
const HEADER_SIZE: usize = 4 + 1 + 32;

/// A cell in packed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCell {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// `0xRRGGBB`.
    pub rgb: u32,
}

impl From<Cell> for StoredCell {
    fn from(cell: Cell) -> Self {
        Self {
            x: cell.x,
            y: cell.y,
            rgb: cell.color.rgb(),
        }
    }
}

impl From<StoredCell> for Cell {
    fn from(cell: StoredCell) -> Self {
        Self {
            x: cell.x,
            y: cell.y,
            color: Color::from_rgb(cell.rgb),
        }
    }
}

/// A chat message in a binary-friendly shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChat {
    /// Author name, if any.
    pub author: Option<String>,
    /// Message text.
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl From<&ChatMessage> for StoredChat {
    fn from(message: &ChatMessage) -> Self {
        Self {
            author: message.author.as_ref().map(|a| a.as_str().to_string()),
            text: message.text.clone(),
            timestamp_ms: message.timestamp.timestamp_millis(),
        }
    }
}

impl From<StoredChat> for ChatMessage {
    fn from(stored: StoredChat) -> Self {
        Self {
            author: stored.author.and_then(|a| Identity::new(a).ok()),
            text: stored.text,
            timestamp: DateTime::<Utc>::from_timestamp_millis(stored.timestamp_ms).unwrap_or_default(),
        }
    }
}

/// Everything needed to rebuild the canvas and chat after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    /// Canvas width when taken.
    pub width: u32,
    /// Canvas height when taken.
    pub height: u32,
    /// Canvas revision when taken.
    pub revision: u64,
    /// Placed cells, row-major by chunk.
    pub cells: Vec<StoredCell>,
    /// Retained chat, oldest first.
    pub chat: Vec<StoredChat>,
}

impl CanvasSnapshot {
    /// Capture the current state. Callers hold both read guards.
    pub fn capture(canvas: &CanvasStore, chat: &ChatLog) -> Self {
        let config = canvas.config();
        Self {
            width: config.width,
            height: config.height,
            revision: canvas.revision(),
            cells: canvas.snapshot().map(StoredCell::from).collect(),
            chat: chat.recent(chat.retention()).iter().map(StoredChat::from).collect(),
        }
    }

    /// Load into freshly created stores. Returns the number of cells
    /// dropped because they fall outside the current dimensions.
    pub fn restore_into(self, canvas: &mut CanvasStore, chat: &mut ChatLog) -> usize {
        let skipped = canvas.restore(self.cells.into_iter().map(Cell::from), self.revision);
        chat.restore(self.chat.into_iter().map(ChatMessage::from));
        skipped
    }

    /// Encode with header and checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        let payload = bincode::serialize(self)?;
        let checksum = hash_with_domain(SNAPSHOT_DOMAIN, &payload);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&checksum);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Validate header and checksum, then decode.
    ///
    /// The error string names the first check that failed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("truncated header ({} bytes)", bytes.len()));
        }
        if bytes[..4] != SNAPSHOT_MAGIC {
            return Err("bad magic".to_string());
        }
        if bytes[4] != SNAPSHOT_VERSION {
            return Err(format!("unsupported version {}", bytes[4]));
        }

        let mut expected: CanvasHash = [0u8; 32];
        expected.copy_from_slice(&bytes[5..HEADER_SIZE]);
        let payload = &bytes[HEADER_SIZE..];
        if hash_with_domain(SNAPSHOT_DOMAIN, payload) != expected {
            return Err("checksum mismatch".to_string());
        }

        bincode::deserialize(payload).map_err(|e| format!("decode failed: {}", e))
    }
}

/// Snapshot file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Snapshot store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn save(&self, snapshot: &CanvasSnapshot) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = snapshot.to_bytes()?;
        let tmp = self.path.with_extension("snap.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(
            "Saved snapshot: {} cells, {} chat, revision {}",
            snapshot.cells.len(),
            snapshot.chat.len(),
            snapshot.revision
        );
        Ok(())
    }

    /// Read the snapshot. `Ok(None)` when there is none yet.
    ///
    /// A file that fails validation is renamed aside and reported as
    /// [`PersistError::Corrupted`].
    pub fn load(&self) -> Result<Option<CanvasSnapshot>, PersistError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match CanvasSnapshot::from_bytes(&bytes) {
            Ok(snapshot) => {
                info!(
                    "Loaded snapshot from {}: {} cells, revision {}",
                    self.path.display(),
                    snapshot.cells.len(),
                    snapshot.revision
                );
                Ok(Some(snapshot))
            }
            Err(reason) => {
                let quarantined = self.quarantine()?;
                warn!("Snapshot {} is corrupt: {}", self.path.display(), reason);
                Err(PersistError::Corrupted { reason, quarantined })
            }
        }
    }

    fn quarantine(&self) -> Result<PathBuf, PersistError> {
        let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let target = self.path.with_extension(format!("snap.{}", suffix));
        fs::rename(&self.path, &target)?;
        Ok(target)
    }
}
