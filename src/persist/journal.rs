//! Placement Journal
//!
//! Append-only history of accepted placements, one JSON object per line.
//! Requests never touch the file: records go through a bounded queue to a
//! writer task that batches them into a buffered append.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::PersistError;
use crate::core::color::Color;
use crate::core::identity::Identity;

/// Records queued before new ones are dropped.
const JOURNAL_QUEUE: usize = 4096;

/// One accepted placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Applied color.
    pub color: Color,
    /// Who placed it.
    pub identity: Identity,
    /// When, milliseconds since the Unix epoch on disk.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

enum JournalCommand {
    Append(PlacementRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to the journal writer. Cheap to clone; the writer stops once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct PlacementJournal {
    tx: mpsc::Sender<JournalCommand>,
}

impl PlacementJournal {
    /// Open `path` for appending and start the writer task.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, JoinHandle<()>), PersistError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!("Placement journal at {}", path.display());

        let (tx, rx) = mpsc::channel(JOURNAL_QUEUE);
        let handle = tokio::spawn(Self::run_writer(path, BufWriter::new(file), rx));
        Ok((Self { tx }, handle))
    }

    /// Queue a record. Never waits; a full queue drops the record.
    pub fn record(&self, record: PlacementRecord) {
        match self.tx.try_send(JournalCommand::Append(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Journal queue full, dropping placement record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Journal writer stopped, dropping placement record");
            }
        }
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Flush(ack_tx))
            .await
            .map_err(|_| PersistError::JournalClosed)?;
        ack_rx.await.map_err(|_| PersistError::JournalClosed)
    }

    /// Read every record in a journal file.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<PlacementRecord>, PersistError> {
        let contents = tokio::fs::read_to_string(path).await?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PersistError::from))
            .collect()
    }

    async fn run_writer(
        path: PathBuf,
        mut writer: BufWriter<tokio::fs::File>,
        mut rx: mpsc::Receiver<JournalCommand>,
    ) {
        let mut written: u64 = 0;

        while let Some(command) = rx.recv().await {
            let mut acks = Vec::new();
            let mut next = Some(command);

            // Drain whatever is already queued into one flush.
            while let Some(command) = next.take() {
                match command {
                    JournalCommand::Append(record) => {
                        if let Err(e) = Self::write_record(&mut writer, &record).await {
                            error!("Journal write to {} failed: {}", path.display(), e);
                        } else {
                            written += 1;
                        }
                    }
                    JournalCommand::Flush(ack) => acks.push(ack),
                }
                next = rx.try_recv().ok();
            }

            if let Err(e) = writer.flush().await {
                error!("Journal flush to {} failed: {}", path.display(), e);
            }
            for ack in acks {
                let _ = ack.send(());
            }
        }

        if let Err(e) = writer.flush().await {
            error!("Journal flush to {} failed: {}", path.display(), e);
        }
        debug!("Journal writer stopped after {} records", written);
    }

    async fn write_record(
        writer: &mut BufWriter<tokio::fs::File>,
        record: &PlacementRecord,
    ) -> Result<(), PersistError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Journal path in a directory that does not exist yet.
    fn journal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("journal").join("placements.jsonl")
    }

    fn record(x: u32, color: &str) -> PlacementRecord {
        PlacementRecord {
            x,
            y: 7,
            color: Color::parse(color).unwrap(),
            identity: Identity::new("alice").unwrap(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        }
    }

    #[test]
    fn test_record_line_format() {
        let json = serde_json::to_value(record(3, "#ABC")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "x": 3,
                "y": 7,
                "color": "#aabbcc",
                "identity": "alice",
                "timestamp": 1_700_000_000_000i64,
            })
        );
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let (journal, handle) = PlacementJournal::open(&path).await.unwrap();

        journal.record(record(1, "#ff0000"));
        journal.record(record(2, "#00ff00"));
        journal.flush().await.unwrap();

        let records = PlacementJournal::read_all(&path).await.unwrap();
        assert_eq!(records, vec![record(1, "#ff0000"), record(2, "#00ff00")]);

        drop(journal);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        {
            let (journal, handle) = PlacementJournal::open(&path).await.unwrap();
            journal.record(record(1, "#000"));
            drop(journal);
            handle.await.unwrap();
        }

        let (journal, handle) = PlacementJournal::open(&path).await.unwrap();
        journal.record(record(2, "#fff"));
        journal.flush().await.unwrap();
        assert_eq!(PlacementJournal::read_all(&path).await.unwrap().len(), 2);

        drop(journal);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_after_writer_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let (journal, handle) = PlacementJournal::open(&path).await.unwrap();
        handle.abort();
        let _ = handle.await;
        assert!(matches!(journal.flush().await, Err(PersistError::JournalClosed)));
    }
}
