use serde::{Deserialize, Serialize};

/// Lifecycle state of a session as seen by external pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Running,
    Stopped,
}

/// The live-stats projection a probe instance writes to its stats file every
/// ~200 ms, and the record shape stored in the completion history.
///
/// Display fields are pre-rounded: percentages to one decimal, RTT/jitter to
/// two decimals, duration to one decimal, blackout values whole milliseconds.
/// `start_time` is fractional unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSnapshot {
    pub test_id: String,
    pub status: ProbeStatus,
    pub sent: u64,
    pub received: u64,
    pub loss_pct: f64,
    pub tx_loss_pct: f64,
    pub rx_loss_pct: f64,
    pub max_blackout_ms: u64,
    pub current_blackout_ms: u64,
    pub avg_rtt_ms: f64,
    pub jitter_ms: f64,
    pub rate_pps: u32,
    pub duration_s: f64,
    /// Fate of the most recent 100 transmitted packets, most-recent-last:
    /// 1 = received (or still in flight), 0 = confirmed missing.
    pub history: Vec<u8>,
    pub start_time: f64,
    pub target: String,
    pub port: u16,
    pub label: String,
    pub source_port: u16,
}
