//! Storage subsystem.
//!
//! All persistence is file-based on purpose: the per-instance snapshot files
//! and the history log are the IPC channel between probe instances and
//! whoever manages them, so a manager can restart independently of running
//! instances and still find their state.
//!
//! Components:
//! - `snapshot_store`: per-instance live-stats JSON files.
//! - `history`: the append-only JSON Lines log of completed sessions.

pub mod history;
pub mod snapshot_store;

pub use history::{HistoryLog, HistoryRecord};
pub use snapshot_store::SnapshotStore;
