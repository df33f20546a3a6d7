use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;

use crate::error_handling::types::ProbeError;
use crate::probe::ledger::SequenceLedger;
use crate::probe::snapshot::ProbeSnapshot;
use crate::probe::wire;
use crate::storage::snapshot_store;

/// Base of the deterministic source-port range: `CONV-042` binds 31042.
pub const SOURCE_PORT_BASE: u16 = 31000;

/// How often the live snapshot is projected to the stats file.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(200);

/// Receive timeout; bounds how long the receiver can miss a stop signal.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Grace period after stop to catch in-flight replies.
pub const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// If the send schedule falls further behind than this, resynchronize to
/// "now" instead of bursting to catch up; a burst would corrupt the rate
/// signal under test.
pub const MAX_SCHEDULE_LAG: Duration = Duration::from_millis(500);

/// Parameters for one probe instance.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub test_id: String,
    pub label: Option<String>,
    pub target: String,
    pub port: u16,
    pub rate_pps: u32,
    pub stats_file: PathBuf,
}

impl ProbeSpec {
    /// Human-facing composite form, used in log lines only; the label is
    /// never parsed back out of it.
    pub fn display_id(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", self.test_id, label),
            None => self.test_id.clone(),
        }
    }
}

/// Cooperative shutdown state machine of a probe instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Draining,
    Terminated,
}

/// Final tally returned once the engine has terminated.
#[derive(Debug, Clone)]
pub struct ProbeSummary {
    pub test_id: String,
    pub sent: u64,
    pub received: u64,
    pub max_blackout_ms: u64,
    pub duration_s: f64,
    pub missing: Vec<u64>,
}

/// One UDP convergence probe: a rate-paced sender, a concurrent receiver for
/// the echoes, and a periodic snapshot writer, all sharing one
/// [`SequenceLedger`] under a mutex. Runs until the stop signal fires or a
/// transmit fails.
pub struct ProbeEngine {
    spec: ProbeSpec,
    state: EngineState,
}

impl ProbeEngine {
    pub fn new(spec: ProbeSpec) -> Self {
        Self {
            spec,
            state: EngineState::Running,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub async fn run(
        &mut self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ProbeSummary, ProbeError> {
        if self.spec.rate_pps == 0 {
            return Err(ProbeError::InvalidRate(0));
        }

        let peer = resolve_target(&self.spec.target, self.spec.port).await?;
        let socket = Arc::new(bind_source_socket(&self.spec.test_id).await?);
        let source_port = socket
            .local_addr()
            .map_err(ProbeError::BindFailed)?
            .port();

        let start_instant = Instant::now();
        let start_epoch = unix_now();
        let label = self.spec.label.clone().unwrap_or_default();
        let ledger = Arc::new(Mutex::new(SequenceLedger::new(
            &self.spec.test_id,
            &label,
            &self.spec.target,
            self.spec.port,
            source_port,
            self.spec.rate_pps,
            start_instant,
            start_epoch,
        )));

        info!(
            "[{}] CONVERGENCE STARTED: {}:{} | Rate: {}pps",
            self.spec.display_id(),
            self.spec.target,
            self.spec.port,
            self.spec.rate_pps
        );
        info!(
            "[{}] Source port: {} (sequence fidelity active)",
            self.spec.display_id(),
            source_port
        );

        // Helper loops live on an internal channel so they keep draining
        // after the external stop fires.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recv_task = tokio::spawn(receiver_loop(
            socket.clone(),
            ledger.clone(),
            shutdown_rx.clone(),
        ));
        let stats_task = tokio::spawn(snapshot_loop(
            ledger.clone(),
            self.spec.stats_file.clone(),
            shutdown_rx,
        ));

        let interval = Duration::from_secs_f64(1.0 / self.spec.rate_pps as f64);
        let mut deadline = tokio::time::Instant::now();
        let mut seq: u64 = 0;

        loop {
            if *stop.borrow() {
                break;
            }
            seq += 1;
            let payload = wire::encode(&self.spec.test_id, &label, seq, unix_now());

            // Bookkeeping strictly before the write: a reply can overtake
            // the send call's return.
            if let Ok(mut l) = ledger.lock() {
                l.record_send(seq, Instant::now());
            }
            if let Err(e) = socket.send_to(payload.as_bytes(), peer).await {
                // A local transmit failure will not heal mid-test; end the
                // session instead of retrying.
                error!(
                    "[{}] Transmit failed on seq {}: {} - stopping session",
                    self.spec.display_id(),
                    seq,
                    e
                );
                break;
            }

            // Drift-correcting schedule: advance the absolute deadline, and
            // resync rather than burst when too far behind.
            deadline += interval;
            let now = tokio::time::Instant::now();
            if now > deadline + MAX_SCHEDULE_LAG {
                debug!(
                    "[{}] Send schedule {}ms behind, resynchronizing",
                    self.spec.display_id(),
                    (now - deadline).as_millis()
                );
                deadline = now;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.state = EngineState::Draining;
        debug!("[{}] Draining for {:?}", self.spec.display_id(), DRAIN_GRACE);
        tokio::time::sleep(DRAIN_GRACE).await;

        let _ = shutdown_tx.send(true);
        let _ = recv_task.await;
        let _ = stats_task.await;

        let (final_snap, missing) = match ledger.lock() {
            Ok(mut l) => (l.snapshot(false, Instant::now()), l.missing_seqs()),
            Err(_) => return Err(ProbeError::ResolveFailed("ledger poisoned".to_string())),
        };
        if let Err(e) = snapshot_store::write_snapshot(&self.spec.stats_file, &final_snap) {
            warn!(
                "[{}] Final snapshot write failed: {}",
                self.spec.display_id(),
                e
            );
        }
        self.state = EngineState::Terminated;
        self.log_summary(&final_snap, &missing);

        Ok(ProbeSummary {
            test_id: self.spec.test_id.clone(),
            sent: final_snap.sent,
            received: final_snap.received,
            max_blackout_ms: final_snap.max_blackout_ms,
            duration_s: final_snap.duration_s,
            missing,
        })
    }

    fn log_summary(&self, snap: &ProbeSnapshot, missing: &[u64]) {
        let id = self.spec.display_id();
        info!("[{}] CONVERGENCE STOPPED:", id);
        info!(
            "[{}]     Duration: {}s | PPS: {}",
            id, snap.duration_s, snap.rate_pps
        );
        info!(
            "[{}]     TX Sent: {} | RX Rcvd: {}",
            id, snap.sent, snap.received
        );
        info!("[{}]     Max Blackout: {}ms", id, snap.max_blackout_ms);
        info!("[{}]     Missed Seqs: {}", id, format_missing(missing));
    }
}

/// Deterministic source port derived from the numeric suffix of the test id
/// (`CONV-042` -> 31042), capped at the valid port ceiling. `None` when the
/// id carries no usable suffix.
pub fn deterministic_source_port(test_id: &str) -> Option<u16> {
    let suffix = test_id.rsplit('-').next()?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let num: u32 = suffix.parse().ok()?;
    if num == 0 {
        return None;
    }
    Some((SOURCE_PORT_BASE as u32 + num).min(u16::MAX as u32) as u16)
}

async fn bind_source_socket(test_id: &str) -> Result<UdpSocket, ProbeError> {
    if let Some(port) = deterministic_source_port(test_id) {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                // Recovered locally; the chosen port is always visible in
                // the stats projection.
                warn!(
                    "Source port {} unavailable ({}), falling back to an ephemeral port",
                    port, e
                );
            }
        }
    }
    UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(ProbeError::BindFailed)
}

async fn resolve_target(target: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    lookup_host((target, port))
        .await
        .map_err(|e| ProbeError::ResolveFailed(format!("{}: {}", target, e)))?
        .next()
        .ok_or_else(|| ProbeError::ResolveFailed(format!("{}: no addresses", target)))
}

async fn receiver_loop(
    socket: Arc<UdpSocket>,
    ledger: Arc<Mutex<SequenceLedger>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        match tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => continue, // timeout, re-check shutdown
            Ok(Err(e)) => {
                if !*shutdown.borrow() {
                    warn!("Receive error: {}", e);
                }
                break;
            }
            Ok(Ok((len, _addr))) => {
                let now = Instant::now();
                let text = String::from_utf8_lossy(&buf[..len]);
                // Malformed payloads are dropped without logging; anything
                // else would be log-spam at line rate.
                if let Some(pkt) = wire::decode(&text) {
                    if let Ok(mut l) = ledger.lock() {
                        l.record_receive(pkt.seq, pkt.server_received, now);
                    }
                }
            }
        }
    }
}

async fn snapshot_loop(
    ledger: Arc<Mutex<SequenceLedger>>,
    stats_file: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let snap = match ledger.lock() {
            Ok(mut l) => Some(l.snapshot(true, Instant::now())),
            Err(_) => None,
        };
        if let Some(snap) = snap {
            if let Err(e) = snapshot_store::write_snapshot(&stats_file, &snap) {
                debug!("Snapshot write to {} failed: {}", stats_file.display(), e);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Renders the missed-sequence list for the stop summary, truncated to the
/// first and last 25 entries with a total count once it gets large.
pub fn format_missing(missing: &[u64]) -> String {
    if missing.is_empty() {
        return "None".to_string();
    }
    let join = |seqs: &[u64]| {
        seqs.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    if missing.len() > 50 {
        format!(
            "[{} ... {}] (Total: {})",
            join(&missing[..25]),
            join(&missing[missing.len() - 25..]),
            missing.len()
        )
    } else {
        format!("[{}]", join(missing))
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo;
    use crate::probe::snapshot::ProbeStatus;
    use crate::storage::snapshot_store;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_deterministic_source_port() {
        assert_eq!(deterministic_source_port("CONV-042"), Some(31042));
        assert_eq!(deterministic_source_port("CONV-999"), Some(31999));
        assert_eq!(deterministic_source_port("CONV-000"), None);
        assert_eq!(deterministic_source_port("adhoc"), None);
        // capped at the valid port ceiling
        assert_eq!(deterministic_source_port("CONV-99999"), Some(65535));
    }

    #[test]
    fn test_format_missing_truncation() {
        assert_eq!(format_missing(&[]), "None");
        assert_eq!(format_missing(&[3, 5]), "[3, 5]");

        let many: Vec<u64> = (1..=60).collect();
        let rendered = format_missing(&many);
        assert!(rendered.starts_with("[1, 2,"));
        assert!(rendered.ends_with("(Total: 60)"));
        assert!(rendered.contains(" ... "));
    }

    #[tokio::test]
    async fn test_zero_rate_rejected() {
        let dir = TempDir::new().unwrap();
        let mut engine = ProbeEngine::new(ProbeSpec {
            test_id: "CONV-001".to_string(),
            label: None,
            target: "127.0.0.1".to_string(),
            port: 6200,
            rate_pps: 0,
            stats_file: dir.path().join("stats.json"),
        });
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            engine.run(rx).await,
            Err(ProbeError::InvalidRate(0))
        ));
    }

    /// End-to-end: 50 pps against an in-process echo responder for ~2s.
    /// Serial because the deterministic source port is a fixed bind.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial_test::serial]
    async fn test_end_to_end_against_echo() {
        let echo_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let echo_port = echo_socket.local_addr().unwrap().port();
        let sessions = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(echo::serve_socket(echo_socket, sessions));

        let dir = TempDir::new().unwrap();
        let stats_file = dir.path().join("convergence_stats_CONV-501.json");
        let spec = ProbeSpec {
            test_id: "CONV-501".to_string(),
            label: Some("loopback".to_string()),
            target: "127.0.0.1".to_string(),
            port: echo_port,
            rate_pps: 50,
            stats_file: stats_file.clone(),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = tokio::spawn(async move {
            let mut engine = ProbeEngine::new(spec);
            let summary = engine.run(stop_rx).await;
            (summary, engine.state())
        });

        tokio::time::sleep(Duration::from_secs(2)).await;

        // mid-run the projection must report a running session
        let live = snapshot_store::read_snapshot(&stats_file).unwrap();
        assert_eq!(live.status, ProbeStatus::Running);
        assert_eq!(live.history.len(), 100);
        assert_eq!(live.source_port, 31501);

        stop_tx.send(true).unwrap();
        let (summary, state) = runner.await.unwrap();
        let summary = summary.unwrap();

        assert_eq!(state, EngineState::Terminated);
        assert!(
            summary.sent >= 95 && summary.sent <= 105,
            "sent {} out of range",
            summary.sent
        );
        let loss_pct = 100.0 * (summary.sent - summary.received) as f64 / summary.sent as f64;
        assert!(loss_pct < 5.0, "loss {}% on loopback", loss_pct);

        let fin = snapshot_store::read_snapshot(&stats_file).unwrap();
        assert_eq!(fin.status, ProbeStatus::Stopped);
        assert_eq!(fin.history.len(), 100);
        assert_eq!(fin.test_id, "CONV-501");
        assert_eq!(fin.label, "loopback");
        // the echo side reports its own counter, so the loss split is live
        assert!(fin.tx_loss_pct >= 0.0 && fin.rx_loss_pct >= 0.0);
    }
}
