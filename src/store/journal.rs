use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::JournalError;
use crate::types::EventRecord;

/// Durable, append-only backing for the event store.
///
/// Implementations must preserve insertion order so that `load_all` replays
/// records exactly as they were appended.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&mut self, record: &EventRecord) -> Result<(), JournalError>;

    async fn load_all(&mut self) -> Result<Vec<EventRecord>, JournalError>;

    /// Undo an `append` that failed or was cancelled before it returned `Ok`.
    /// A no-op when the last append completed.
    async fn discard_pending(&mut self) -> Result<(), JournalError>;

    async fn flush(&mut self) -> Result<(), JournalError>;

    fn describe(&self) -> String;
}

/// One JSON object per line, using the export field names.
pub struct JsonlJournal {
    path: PathBuf,
    file: File,
    committed_len: u64,
    dirty: bool,
}

impl JsonlJournal {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;
        let committed_len = file.metadata().await?.len();

        info!("Opened event journal at {} ({} bytes)", path.display(), committed_len);
        Ok(Self {
            path,
            file,
            committed_len,
            dirty: false,
        })
    }

    /// Drop any bytes past the last fully written line.
    async fn rollback(&mut self) -> Result<(), JournalError> {
        self.file.set_len(self.committed_len).await?;
        self.dirty = false;
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), JournalError> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl Journal for JsonlJournal {
    async fn append(&mut self, record: &EventRecord) -> Result<(), JournalError> {
        if self.dirty {
            debug!("Rolling back torn write in {}", self.path.display());
            self.rollback().await?;
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.dirty = true;
        if let Err(e) = self.write_line(&line).await {
            if let Err(rollback_err) = self.rollback().await {
                warn!("Failed to roll back partial write: {}", rollback_err);
            }
            return Err(e);
        }

        self.committed_len += line.len() as u64;
        self.dirty = false;
        Ok(())
    }

    async fn load_all(&mut self) -> Result<Vec<EventRecord>, JournalError> {
        let content = fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut lines = content.split_inclusive('\n').enumerate().peekable();

        while let Some((index, line)) = lines.next() {
            let is_last = lines.peek().is_none();
            let trimmed = line.trim();
            if trimmed.is_empty() {
                offset += line.len();
                continue;
            }

            match serde_json::from_str::<EventRecord>(trimmed) {
                Ok(record) => records.push(record),
                Err(e) if is_last && !line.ends_with('\n') => {
                    warn!(
                        "Discarding torn final entry at line {} of {}: {}",
                        index + 1,
                        self.path.display(),
                        e
                    );
                    self.committed_len = offset as u64;
                    self.rollback().await?;
                    break;
                }
                Err(e) => {
                    return Err(JournalError::Corrupt {
                        location: format!("{}:{}", self.path.display(), index + 1),
                        reason: e.to_string(),
                    });
                }
            }
            offset += line.len();
        }

        Ok(records)
    }

    async fn discard_pending(&mut self) -> Result<(), JournalError> {
        if self.dirty {
            debug!("Discarding unacknowledged write in {}", self.path.display());
            self.rollback().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), JournalError> {
        self.file.sync_all().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}
