use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::probe::snapshot::{ProbeSnapshot, ProbeStatus};

/// Number of slots in the packet-fate history.
pub const HISTORY_SLOTS: usize = 100;

/// Absolute floor of the blackout threshold in milliseconds. The effective
/// threshold is `max(100ms, 1.5 x send interval)`.
pub const BLACKOUT_FLOOR_MS: f64 = 100.0;

/// Per-session sequence bookkeeping, written concurrently by the sender and
/// receiver paths. Callers hold one `Mutex<SequenceLedger>`; every method
/// assumes the lock is already held, so each snapshot is internally
/// consistent at the moment it is taken.
///
/// `sent_times` is retained for the life of the session rather than pruned;
/// sessions are operator-bounded, not long-running daemons.
pub struct SequenceLedger {
    test_id: String,
    label: String,
    target: String,
    port: u16,
    source_port: u16,
    rate_pps: u32,
    interval: Duration,
    start_instant: Instant,
    start_epoch: f64,
    sent_count: u64,
    sent_times: HashMap<u64, Instant>,
    received_seqs: BTreeSet<u64>,
    rtts: Vec<f64>,
    last_transit_s: Option<f64>,
    jitter_s: f64,
    last_rcvd: Instant,
    max_blackout_ms: u64,
    server_received: u64,
}

impl SequenceLedger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        test_id: &str,
        label: &str,
        target: &str,
        port: u16,
        source_port: u16,
        rate_pps: u32,
        start_instant: Instant,
        start_epoch: f64,
    ) -> Self {
        Self {
            test_id: test_id.to_string(),
            label: label.to_string(),
            target: target.to_string(),
            port,
            source_port,
            rate_pps,
            interval: Duration::from_secs_f64(1.0 / rate_pps.max(1) as f64),
            start_instant,
            start_epoch,
            sent_count: 0,
            sent_times: HashMap::new(),
            received_seqs: BTreeSet::new(),
            rtts: Vec::new(),
            last_transit_s: None,
            jitter_s: 0.0,
            last_rcvd: start_instant,
            max_blackout_ms: 0,
            server_received: 0,
        }
    }

    /// Records a transmitted sequence number. Must be called before the
    /// socket write so a reply racing the send call finds its entry.
    pub fn record_send(&mut self, seq: u64, at: Instant) {
        self.sent_count = seq;
        self.sent_times.insert(seq, at);
    }

    /// Records an echoed sequence. Duplicate and late re-deliveries of an
    /// already-seen sequence are ignored for metric purposes.
    pub fn record_receive(&mut self, seq: u64, server_count: u64, at: Instant) {
        if self.received_seqs.contains(&seq) {
            return;
        }
        self.received_seqs.insert(seq);
        self.last_rcvd = at;

        if server_count > self.server_received {
            self.server_received = server_count;
        }

        if let Some(&sent_at) = self.sent_times.get(&seq) {
            let transit_s = at.saturating_duration_since(sent_at).as_secs_f64();
            self.rtts.push(transit_s * 1000.0);

            // RFC 3550 6.4.1 jitter EWMA, smoothing factor 1/16
            if let Some(prev) = self.last_transit_s {
                let d = (transit_s - prev).abs();
                self.jitter_s += (d - self.jitter_s) / 16.0;
            }
            self.last_transit_s = Some(transit_s);
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    pub fn received_count(&self) -> u64 {
        self.received_seqs.len() as u64
    }

    /// Sequence numbers transmitted but never echoed back, in order.
    pub fn missing_seqs(&self) -> Vec<u64> {
        (1..=self.sent_count)
            .filter(|s| !self.received_seqs.contains(s))
            .collect()
    }

    fn threshold_ms(&self) -> f64 {
        (self.interval.as_secs_f64() * 1500.0).max(BLACKOUT_FLOOR_MS)
    }

    fn avg_rtt_ms(&self) -> f64 {
        if self.rtts.is_empty() {
            0.0
        } else {
            self.rtts.iter().sum::<f64>() / self.rtts.len() as f64
        }
    }

    /// Derives the live-stats projection at `now`, updating the blackout
    /// ratchet as a side effect. Once `running` is false the outage clock is
    /// frozen so a completed test does not report a growing blackout, and a
    /// perfect run (received >= sent) gets its transient blackout and
    /// history marks cleaned up.
    pub fn snapshot(&mut self, running: bool, now: Instant) -> ProbeSnapshot {
        let seq = self.sent_count;
        let rcvd = self.received_seqs.len() as u64;

        let outage_ms = if running {
            now.saturating_duration_since(self.last_rcvd).as_millis() as u64
        } else {
            0
        };

        let threshold_ms = self.threshold_ms();
        let threshold = Duration::from_secs_f64(threshold_ms / 1000.0);

        // Fate of the last 100 sent packets, most-recent-last. A missing
        // sequence younger than the blackout threshold stays marked 1: it
        // may yet arrive, and will flip its slot if it does.
        let mut history: Vec<u8> = Vec::with_capacity(HISTORY_SLOTS);
        if seq > 0 {
            let first = seq.saturating_sub(HISTORY_SLOTS as u64 - 1).max(1);
            for s in first..=seq {
                if self.received_seqs.contains(&s) {
                    history.push(1);
                } else {
                    let sent_at = self.sent_times.get(&s).copied().unwrap_or(now);
                    let age = now.saturating_duration_since(sent_at);
                    history.push(if age > threshold { 0 } else { 1 });
                }
            }
        }
        if history.len() < HISTORY_SLOTS {
            let mut padded = vec![1u8; HISTORY_SLOTS - history.len()];
            padded.extend(history);
            history = padded;
        }

        let has_seq_gap = seq > rcvd;
        let is_blackout = (outage_ms as f64) > threshold_ms && has_seq_gap;
        if is_blackout {
            self.max_blackout_ms = self.max_blackout_ms.max(outage_ms);
        }

        // Perfect-run cleanup: any blackout seen mid-run was just jitter.
        if !running && rcvd >= seq {
            self.max_blackout_ms = 0;
            history = vec![1u8; HISTORY_SLOTS];
        }

        let total_loss = if seq > 0 {
            round1((1.0 - rcvd as f64 / seq as f64) * 100.0)
        } else {
            0.0
        };
        let (tx_loss, rx_loss) = if self.server_received > 0 && seq > 0 {
            (
                round1((1.0 - self.server_received as f64 / seq as f64) * 100.0),
                round1((1.0 - rcvd as f64 / self.server_received as f64) * 100.0),
            )
        } else {
            (total_loss, 0.0)
        };

        ProbeSnapshot {
            test_id: self.test_id.clone(),
            status: if running {
                ProbeStatus::Running
            } else {
                ProbeStatus::Stopped
            },
            sent: seq,
            received: rcvd,
            loss_pct: total_loss.max(0.0),
            tx_loss_pct: tx_loss.max(0.0),
            rx_loss_pct: rx_loss.max(0.0),
            max_blackout_ms: self.max_blackout_ms,
            current_blackout_ms: if is_blackout { outage_ms } else { 0 },
            avg_rtt_ms: round2(self.avg_rtt_ms()),
            jitter_ms: round2(self.jitter_s * 1000.0),
            rate_pps: self.rate_pps,
            duration_s: round1(now.saturating_duration_since(self.start_instant).as_secs_f64()),
            history,
            start_time: self.start_epoch,
            target: self.target.clone(),
            port: self.port,
            label: self.label.clone(),
            source_port: self.source_port,
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(rate: u32) -> (SequenceLedger, Instant) {
        let t0 = Instant::now();
        let ledger = SequenceLedger::new(
            "CONV-007",
            "lab",
            "10.0.0.1",
            6200,
            31007,
            rate,
            t0,
            1714000000.0,
        );
        (ledger, t0)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_sent_count_tracks_highest_sequence() {
        let (mut l, t0) = ledger(50);
        for seq in 1..=5 {
            l.record_send(seq, t0 + ms(seq * 20));
        }
        assert_eq!(l.sent_count(), 5);
        assert_eq!(l.received_count(), 0);
        assert_eq!(l.missing_seqs(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_receive_is_idempotent() {
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);
        l.record_send(2, t0 + ms(20));

        l.record_receive(1, 1, t0 + ms(10));
        l.record_receive(2, 2, t0 + ms(35));
        let snap_before = l.snapshot(true, t0 + ms(40));

        // same sequence again, with a wildly different implied RTT
        l.record_receive(2, 2, t0 + ms(900));
        let snap_after = l.snapshot(true, t0 + ms(40));

        assert_eq!(snap_before.received, 2);
        assert_eq!(snap_after.received, 2);
        assert_eq!(snap_before.avg_rtt_ms, snap_after.avg_rtt_ms);
        assert_eq!(snap_before.jitter_ms, snap_after.jitter_ms);
    }

    #[test]
    fn test_jitter_ewma_updates_per_first_receive() {
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);
        l.record_send(2, t0 + ms(20));
        // transits: 10ms then 14ms -> d = 4ms, jitter = 4/16 ms
        l.record_receive(1, 0, t0 + ms(10));
        l.record_receive(2, 0, t0 + ms(34));

        let snap = l.snapshot(true, t0 + ms(40));
        assert!((snap.jitter_ms - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_blackout_requires_threshold_and_gap() {
        // 50 pps -> 20ms interval -> threshold = max(100, 30) = 100ms
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);
        l.record_receive(1, 1, t0);
        l.record_send(2, t0 + ms(20));

        // 35ms of silence with a gap: under the 100ms threshold, no blackout
        let snap = l.snapshot(true, t0 + ms(35));
        assert_eq!(snap.current_blackout_ms, 0);
        assert_eq!(snap.max_blackout_ms, 0);

        // 150ms of silence with a gap: blackout, ratchet updates
        let snap = l.snapshot(true, t0 + ms(150));
        assert_eq!(snap.current_blackout_ms, 150);
        assert_eq!(snap.max_blackout_ms, 150);

        // ratchet never goes back down while running
        l.record_receive(2, 2, t0 + ms(160));
        let snap = l.snapshot(true, t0 + ms(170));
        assert_eq!(snap.current_blackout_ms, 0);
        assert_eq!(snap.max_blackout_ms, 150);
    }

    #[test]
    fn test_no_blackout_without_sequence_gap() {
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);
        l.record_receive(1, 1, t0 + ms(5));
        // long silence but nothing outstanding
        let snap = l.snapshot(true, t0 + ms(500));
        assert_eq!(snap.current_blackout_ms, 0);
        assert_eq!(snap.max_blackout_ms, 0);
    }

    #[test]
    fn test_perfect_run_cleanup() {
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);
        l.record_send(2, t0 + ms(20));
        // force a mid-run blackout verdict
        let snap = l.snapshot(true, t0 + ms(200));
        assert!(snap.max_blackout_ms > 0);

        // everything arrives late; the final stopped snapshot is clean
        l.record_receive(1, 1, t0 + ms(210));
        l.record_receive(2, 2, t0 + ms(215));
        let fin = l.snapshot(false, t0 + ms(220));
        assert_eq!(fin.status, ProbeStatus::Stopped);
        assert_eq!(fin.max_blackout_ms, 0);
        assert_eq!(fin.current_blackout_ms, 0);
        assert!(fin.history.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_history_pads_left_at_startup() {
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);
        l.record_receive(1, 1, t0 + ms(5));
        let snap = l.snapshot(true, t0 + ms(10));
        assert_eq!(snap.history.len(), HISTORY_SLOTS);
        assert!(snap.history.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_history_in_flight_grace_then_confirmed_missing() {
        let (mut l, t0) = ledger(50);
        l.record_send(1, t0);

        // younger than the 100ms threshold: still counted as in flight
        let snap = l.snapshot(true, t0 + ms(50));
        assert_eq!(snap.history[HISTORY_SLOTS - 1], 1);

        // past the threshold without arrival: confirmed missing
        let snap = l.snapshot(true, t0 + ms(150));
        assert_eq!(snap.history[HISTORY_SLOTS - 1], 0);

        // a late arrival flips the slot back
        l.record_receive(1, 1, t0 + ms(160));
        let snap = l.snapshot(true, t0 + ms(170));
        assert_eq!(snap.history[HISTORY_SLOTS - 1], 1);
    }

    #[test]
    fn test_loss_split_from_server_counter() {
        let (mut l, t0) = ledger(10);
        for seq in 1..=10 {
            l.record_send(seq, t0 + ms(seq * 100));
        }
        // server saw 8 of 10; we got 6 of those back
        for seq in 1..=6 {
            l.record_receive(seq, 8, t0 + ms(seq * 100 + 10));
        }
        let snap = l.snapshot(true, t0 + ms(1100));
        assert_eq!(snap.loss_pct, 40.0);
        assert_eq!(snap.tx_loss_pct, 20.0);
        assert_eq!(snap.rx_loss_pct, 25.0);
    }

    #[test]
    fn test_missing_seqs_enumeration() {
        let (mut l, t0) = ledger(50);
        for seq in 1..=6 {
            l.record_send(seq, t0 + ms(seq * 20));
        }
        for seq in [1u64, 2, 4, 6] {
            l.record_receive(seq, 0, t0 + ms(seq * 20 + 5));
        }
        assert_eq!(l.missing_seqs(), vec![3, 5]);
    }
}
