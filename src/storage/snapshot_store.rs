use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::error_handling::types::StorageError;
use crate::probe::snapshot::ProbeSnapshot;

const SNAPSHOT_PREFIX: &str = "convergence_stats_";

/// Writes one snapshot to its stats file, replacing any previous projection.
pub fn write_snapshot(path: &Path, snapshot: &ProbeSnapshot) -> Result<(), StorageError> {
    let json = serde_json::to_string(snapshot).map_err(|e| {
        error!("Failed to serialize snapshot for {}: {}", snapshot.test_id, e);
        StorageError::WriteFailed
    })?;
    fs::write(path, json).map_err(|e| {
        debug!("Failed to write snapshot {}: {}", path.display(), e);
        StorageError::WriteFailed
    })
}

/// Reads one snapshot file.
pub fn read_snapshot(path: &Path) -> Result<ProbeSnapshot, StorageError> {
    let content = fs::read_to_string(path).map_err(|_| StorageError::ReadFailed)?;
    serde_json::from_str(&content).map_err(|e| {
        debug!("Unparseable snapshot {}: {}", path.display(), e);
        StorageError::ReadFailed
    })
}

/// The per-instance snapshot directory: one `convergence_stats_<id>.json`
/// file per instance, written by the instance and read by anyone.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    stats_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(stats_dir: P) -> Result<Self, StorageError> {
        let stats_dir = stats_dir.as_ref().to_path_buf();
        fs::create_dir_all(&stats_dir).map_err(|e| {
            error!("Failed to create stats dir {}: {}", stats_dir.display(), e);
            StorageError::WriteFailed
        })?;
        Ok(Self { stats_dir })
    }

    pub fn path_for(&self, test_id: &str) -> PathBuf {
        self.stats_dir
            .join(format!("{}{}.json", SNAPSHOT_PREFIX, test_id))
    }

    pub fn read(&self, test_id: &str) -> Result<ProbeSnapshot, StorageError> {
        read_snapshot(&self.path_for(test_id))
    }

    /// Enumerates every readable snapshot in the directory. Unparseable or
    /// unreadable files are skipped, not errors: a half-written file just
    /// means the poller is slightly early.
    pub fn list(&self) -> Result<Vec<ProbeSnapshot>, StorageError> {
        let entries = fs::read_dir(&self.stats_dir).map_err(|e| {
            error!("Failed to read stats dir {}: {}", self.stats_dir.display(), e);
            StorageError::ReadFailed
        })?;

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with(SNAPSHOT_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            if let Ok(snap) = read_snapshot(&path) {
                snapshots.push(snap);
            }
        }
        snapshots.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        Ok(snapshots)
    }

    pub fn remove(&self, test_id: &str) -> Result<(), StorageError> {
        fs::remove_file(self.path_for(test_id)).map_err(|_| StorageError::WriteFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::snapshot::ProbeStatus;
    use tempfile::TempDir;

    fn sample(test_id: &str) -> ProbeSnapshot {
        ProbeSnapshot {
            test_id: test_id.to_string(),
            status: ProbeStatus::Running,
            sent: 100,
            received: 98,
            loss_pct: 2.0,
            tx_loss_pct: 1.0,
            rx_loss_pct: 1.0,
            max_blackout_ms: 250,
            current_blackout_ms: 0,
            avg_rtt_ms: 12.34,
            jitter_ms: 0.56,
            rate_pps: 50,
            duration_s: 2.0,
            history: vec![1; 100],
            start_time: 1714000000.5,
            target: "10.0.0.1".to_string(),
            port: 6200,
            label: "lab".to_string(),
            source_port: 31042,
        }
    }

    #[test]
    fn test_write_read_roundtrip_preserves_precision() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let snap = sample("CONV-042");

        write_snapshot(&store.path_for("CONV-042"), &snap).unwrap();
        let loaded = store.read("CONV-042").unwrap();
        assert_eq!(loaded.test_id, "CONV-042");
        assert_eq!(loaded.avg_rtt_ms, 12.34);
        assert_eq!(loaded.max_blackout_ms, 250);
        assert_eq!(loaded.history.len(), 100);
        assert_eq!(loaded.source_port, 31042);
    }

    #[test]
    fn test_list_skips_unparseable_files() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        write_snapshot(&store.path_for("CONV-001"), &sample("CONV-001")).unwrap();
        write_snapshot(&store.path_for("CONV-002"), &sample("CONV-002")).unwrap();
        std::fs::write(store.path_for("CONV-003"), "{not json").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "noise").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|s| s.test_id).collect();
        assert_eq!(ids, vec!["CONV-001", "CONV-002"]);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        write_snapshot(&store.path_for("CONV-001"), &sample("CONV-001")).unwrap();

        store.remove("CONV-001").unwrap();
        assert!(store.read("CONV-001").is_err());
        assert!(store.remove("CONV-001").is_err());
    }
}
