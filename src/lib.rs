pub mod configuration;
pub use configuration::config::Config;

pub mod echo;

pub mod error_handling;
pub use error_handling::types::*;

pub mod orchestrator;
pub use orchestrator::manager::{ProbeManager, StatusEntry};

pub mod probe;
pub use probe::engine::{ProbeEngine, ProbeSpec};
pub use probe::snapshot::{ProbeSnapshot, ProbeStatus};

pub mod storage;
pub use storage::history::{HistoryLog, HistoryRecord};
pub use storage::snapshot_store::SnapshotStore;
