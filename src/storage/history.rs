use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::StorageError;
use crate::probe::snapshot::ProbeSnapshot;

/// A completed session: its final live-stats projection plus the wall-clock
/// time the completion was recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub completed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: ProbeSnapshot,
}

/// Append-only JSON Lines log of completed sessions.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Appends one completion record, stamped with the current time.
    pub fn append(&self, snapshot: &ProbeSnapshot) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create history dir {}: {}", parent.display(), e);
                StorageError::WriteFailed
            })?;
        }
        let record = HistoryRecord {
            completed_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        let line = serde_json::to_string(&record).map_err(|e| {
            error!("Failed to serialize history record: {}", e);
            StorageError::WriteFailed
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                error!("Failed to open history log {}: {}", self.path.display(), e);
                StorageError::WriteFailed
            })?;
        writeln!(file, "{}", line).map_err(|e| {
            error!("Failed to append to history log {}: {}", self.path.display(), e);
            StorageError::WriteFailed
        })
    }

    /// Reads completion records, most-recent-first, up to `limit`. A missing
    /// log file is an empty history, not an error; corrupt lines are skipped.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<HistoryRecord>, StorageError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                error!("Failed to read history log {}: {}", self.path.display(), e);
                return Err(StorageError::ReadFailed);
            }
        };

        let mut records: Vec<HistoryRecord> = Vec::new();
        for line in content.lines() {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping corrupt history line: {}", e),
            }
        }
        records.reverse();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}
