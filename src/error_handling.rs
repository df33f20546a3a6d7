pub mod types;

pub use types::{ConfigError, OrchestratorError, ProbeError, StorageError};
