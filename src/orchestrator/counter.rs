use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::StorageError;

/// Test ids rotate through this many slots before wrapping back to 1.
pub const COUNTER_MODULUS: u64 = 1000;

#[derive(Debug, Serialize, Deserialize)]
struct CounterFile {
    counter: u64,
}

/// Durable sequential test-id counter.
///
/// The last issued value lives in a small JSON file so ids keep advancing
/// across restarts. Ids take the form `CONV-001` .. `CONV-999`, then wrap
/// back to `CONV-001`; with a thousand-slot cycle a collision with a
/// still-relevant old session is not a practical concern. The zero slot is
/// never issued: `CONV-000` is the ad-hoc id of a probe run outside the
/// orchestrator and carries no deterministic source port.
#[derive(Debug, Clone)]
pub struct TestIdCounter {
    path: PathBuf,
}

impl TestIdCounter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Issues the next id and persists the advanced counter.
    pub fn next_id(&self) -> Result<String, StorageError> {
        let current = self.load();
        let next = if current >= COUNTER_MODULUS - 1 {
            1
        } else {
            current + 1
        };
        self.store(next)?;
        Ok(format!("CONV-{:03}", next))
    }

    /// Rewinds the counter to zero; the next id issued is `CONV-001`.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.store(0)
    }

    /// Reads the persisted counter. A missing or unreadable file restarts
    /// the cycle at zero rather than refusing to issue ids.
    fn load(&self) -> u64 {
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<CounterFile>(&content) {
                Ok(state) => state.counter % COUNTER_MODULUS,
                Err(e) => {
                    warn!(
                        "Counter file {} unparseable ({}), restarting cycle",
                        self.path.display(),
                        e
                    );
                    0
                }
            },
            Err(e) => {
                debug!("Counter file {} not read ({}), starting at 0", self.path.display(), e);
                0
            }
        }
    }

    fn store(&self, value: u64) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create counter dir {}: {}", parent.display(), e);
                StorageError::WriteFailed
            })?;
        }
        let json = serde_json::to_string(&CounterFile { counter: value }).map_err(|e| {
            error!("Failed to serialize counter: {}", e);
            StorageError::WriteFailed
        })?;
        fs::write(&self.path, json).map_err(|e| {
            error!("Failed to write counter file {}: {}", self.path.display(), e);
            StorageError::WriteFailed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sequential_ids_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");

        let counter = TestIdCounter::new(&path);
        assert_eq!(counter.next_id().unwrap(), "CONV-001");
        assert_eq!(counter.next_id().unwrap(), "CONV-002");

        // a fresh handle picks up where the file left off
        let reloaded = TestIdCounter::new(&path);
        assert_eq!(reloaded.next_id().unwrap(), "CONV-003");
    }

    #[test]
    fn test_wrap_skips_zero_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");
        fs::write(&path, r#"{"counter": 998}"#).unwrap();

        // the zero slot is reserved for ad-hoc runs; every issued id keeps
        // a nonzero suffix and with it a deterministic source port
        let counter = TestIdCounter::new(&path);
        assert_eq!(counter.next_id().unwrap(), "CONV-999");
        assert_eq!(counter.next_id().unwrap(), "CONV-001");
        assert_eq!(counter.next_id().unwrap(), "CONV-002");
    }

    #[test]
    fn test_corrupt_file_restarts_cycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");
        fs::write(&path, "{broken").unwrap();

        let counter = TestIdCounter::new(&path);
        assert_eq!(counter.next_id().unwrap(), "CONV-001");
    }

    #[test]
    fn test_reset() {
        let dir = TempDir::new().unwrap();
        let counter = TestIdCounter::new(dir.path().join("counter.json"));
        counter.next_id().unwrap();
        counter.next_id().unwrap();

        counter.reset().unwrap();
        assert_eq!(counter.next_id().unwrap(), "CONV-001");
    }
}
