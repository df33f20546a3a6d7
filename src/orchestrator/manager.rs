use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::configuration::config::Config;
use crate::error_handling::types::OrchestratorError;
use crate::orchestrator::counter::TestIdCounter;
use crate::orchestrator::launcher::{ProbeHandle, ProbeLauncher, ProcessLauncher};
use crate::probe::engine::ProbeSpec;
use crate::probe::snapshot::ProbeSnapshot;
use crate::storage::history::{HistoryLog, HistoryRecord};
use crate::storage::snapshot_store::SnapshotStore;

/// One registry slot: the control handle plus the packet rate this session
/// holds against the global budget.
struct Registration {
    reserved_pps: u32,
    handle: ProbeHandle,
}

type Registry = Arc<Mutex<HashMap<String, Registration>>>;

/// One row of the status view: the instance's latest stats projection,
/// tagged with whether this manager currently holds a handle for it.
#[derive(Debug, Serialize)]
pub struct StatusEntry {
    pub live: bool,
    #[serde(flatten)]
    pub snapshot: ProbeSnapshot,
}

/// Lifecycle authority over the probe population.
///
/// Admits new sessions against the global packet-rate budget, issues test
/// ids, launches instances through the [`ProbeLauncher`] seam, and archives
/// each finished session into the history log exactly once.
pub struct ProbeManager {
    launcher: Arc<dyn ProbeLauncher>,
    registry: Registry,
    snapshots: SnapshotStore,
    history: HistoryLog,
    counter: TestIdCounter,
    max_total_pps: u32,
}

impl ProbeManager {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn ProbeLauncher>,
    ) -> Result<Self, OrchestratorError> {
        Ok(Self {
            launcher,
            registry: Arc::new(Mutex::new(HashMap::new())),
            snapshots: SnapshotStore::new(&config.stats_dir)?,
            history: HistoryLog::new(&config.history_file),
            counter: TestIdCounter::new(&config.counter_file),
            max_total_pps: config.max_total_pps,
        })
    }

    /// Production wiring: probes run as child processes of this binary.
    pub fn with_process_launcher(config: &Config) -> Result<Self, OrchestratorError> {
        let launcher = ProcessLauncher::new(Duration::from_secs(config.stop_timeout_secs));
        Self::new(config, Arc::new(launcher))
    }

    /// Starts a new probe session and returns its assigned test id.
    ///
    /// The session's rate is reserved against the global budget for as long
    /// as its registry entry lives; [`stop`](Self::stop) releases it
    /// immediately, without waiting for the instance to finish draining.
    pub fn start(
        &self,
        target: &str,
        port: u16,
        rate_pps: u32,
        label: Option<String>,
    ) -> Result<String, OrchestratorError> {
        if rate_pps == 0 {
            return Err(OrchestratorError::InvalidRate(rate_pps));
        }

        let mut registry = self
            .registry
            .lock()
            .map_err(|_| OrchestratorError::LaunchFailed("registry poisoned".to_string()))?;

        let in_use_pps: u32 = registry.values().map(|r| r.reserved_pps).sum();
        let over_ceiling = match in_use_pps.checked_add(rate_pps) {
            Some(total) => total > self.max_total_pps,
            None => true,
        };
        if over_ceiling {
            warn!(
                "Rejected session at {}pps: {}pps in use of {}pps ceiling",
                rate_pps, in_use_pps, self.max_total_pps
            );
            return Err(OrchestratorError::CapacityExceeded {
                requested_pps: rate_pps,
                in_use_pps,
                ceiling_pps: self.max_total_pps,
            });
        }

        let test_id = self.counter.next_id()?;
        let spec = ProbeSpec {
            test_id: test_id.clone(),
            label,
            target: target.to_string(),
            port,
            rate_pps,
            stats_file: self.snapshots.path_for(&test_id),
        };
        let mut handle = self.launcher.launch(&spec)?;
        let exit = handle.take_exit();
        registry.insert(
            test_id.clone(),
            Registration {
                reserved_pps: rate_pps,
                handle,
            },
        );
        drop(registry);

        info!(
            "Session {} admitted: {}:{} at {}pps ({}pps now in use)",
            test_id,
            target,
            port,
            rate_pps,
            in_use_pps + rate_pps
        );

        // Archive the session whenever the instance exits, whether through
        // stop(), a signal delivered to the child directly, or a crash.
        if let Some(exit) = exit {
            let registry = self.registry.clone();
            let snapshots = self.snapshots.clone();
            let history = self.history.clone();
            let watched_id = test_id.clone();
            tokio::spawn(async move {
                let _ = exit.await;
                reconcile(&registry, &snapshots, &history, &watched_id);
            });
        }

        Ok(test_id)
    }

    /// Signals one session (or every session, with `None`) to stop and
    /// returns the ids signalled. The budget is released here; archival
    /// happens once the instance actually exits.
    pub fn stop(&self, test_id: Option<&str>) -> Result<Vec<String>, OrchestratorError> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| OrchestratorError::LaunchFailed("registry poisoned".to_string()))?;

        let targets: Vec<String> = match test_id {
            Some(id) => {
                if !registry.contains_key(id) {
                    return Err(OrchestratorError::NotFound(id.to_string()));
                }
                vec![id.to_string()]
            }
            None => registry.keys().cloned().collect(),
        };

        for id in &targets {
            if let Some(registration) = registry.remove(id) {
                registration.handle.signal_stop();
                info!(
                    "Session {} stopping ({}pps released)",
                    id, registration.reserved_pps
                );
            }
        }
        Ok(targets)
    }

    /// Current view of every known instance: everything with a stats file,
    /// tagged live when this manager holds its handle.
    pub fn status(&self) -> Result<Vec<StatusEntry>, OrchestratorError> {
        let snapshots = self.snapshots.list()?;
        let registry = self
            .registry
            .lock()
            .map_err(|_| OrchestratorError::LaunchFailed("registry poisoned".to_string()))?;
        Ok(snapshots
            .into_iter()
            .map(|snapshot| StatusEntry {
                live: registry.contains_key(&snapshot.test_id),
                snapshot,
            })
            .collect())
    }

    /// Completed sessions, most recent first.
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryRecord>, OrchestratorError> {
        Ok(self.history.read(limit)?)
    }

    /// Rewinds the id counter; the next session becomes `CONV-001`.
    pub fn reset_counter(&self) -> Result<(), OrchestratorError> {
        self.counter.reset()?;
        info!("Test id counter reset");
        Ok(())
    }

    /// Packet rate currently reserved across all registered sessions.
    pub fn current_total_pps(&self) -> u32 {
        match self.registry.lock() {
            Ok(registry) => registry.values().map(|r| r.reserved_pps).sum(),
            Err(_) => 0,
        }
    }
}

impl Drop for ProbeManager {
    fn drop(&mut self) {
        if let Ok(registry) = self.registry.lock() {
            if !registry.is_empty() {
                warn!(
                    "Manager dropped with {} sessions still registered",
                    registry.len()
                );
            }
        }
    }
}

/// Archives one finished session: drop its registry slot, move its final
/// snapshot into the history log, delete the stats file. Gated on the stats
/// file still existing, so running it twice appends exactly one record.
fn reconcile(registry: &Registry, snapshots: &SnapshotStore, history: &HistoryLog, test_id: &str) {
    if let Ok(mut map) = registry.lock() {
        map.remove(test_id);
    }
    match snapshots.read(test_id) {
        Ok(snapshot) => {
            if let Err(e) = history.append(&snapshot) {
                // Stats file stays in place so a later pass can retry.
                error!("Failed to archive session {}: {}", test_id, e);
                return;
            }
            if let Err(e) = snapshots.remove(test_id) {
                warn!("Failed to remove stats file for {}: {}", test_id, e);
            }
            info!(
                "Session {} archived: {}/{} received, max blackout {}ms",
                test_id, snapshot.received, snapshot.sent, snapshot.max_blackout_ms
            );
        }
        Err(_) => debug!("Session {} already reconciled", test_id),
    }
}
