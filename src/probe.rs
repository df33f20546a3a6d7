//! Probe engine subsystem.
//!
//! One probe instance floods a UDP path with sequence-numbered datagrams at a
//! fixed packet rate, consumes the echoes coming back from the far end, and
//! keeps live loss/RTT/jitter/blackout statistics that it periodically
//! projects to a per-instance stats file.
//!
//! Components:
//! - `wire`: the delimiter-separated datagram payload codec.
//! - `ledger`: per-session sequence bookkeeping and metric derivation.
//! - `snapshot`: the serializable live-stats projection polled by others.
//! - `engine`: the paced sender / receiver / snapshot-writer loops and the
//!   cooperative shutdown state machine.

pub mod engine;
pub mod ledger;
pub mod snapshot;
pub mod wire;

pub use engine::{EngineState, ProbeEngine, ProbeSpec, ProbeSummary};
pub use ledger::SequenceLedger;
pub use snapshot::{ProbeSnapshot, ProbeStatus};
