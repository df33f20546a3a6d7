use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadRateCeiling(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadRateCeiling(e) => write!(f, "Rate ceiling error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum ProbeError {
    BindFailed(std::io::Error),
    ResolveFailed(String),
    InvalidRate(u32),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::BindFailed(e) => write!(f, "Socket bind failed: {}", e),
            ProbeError::ResolveFailed(e) => write!(f, "Target resolution failed: {}", e),
            ProbeError::InvalidRate(r) => write!(f, "Invalid packet rate: {} pps", r),
        }
    }
}

impl std::error::Error for ProbeError {}

#[derive(Debug)]
pub enum StorageError {
    WriteFailed,
    ReadFailed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum OrchestratorError {
    CapacityExceeded {
        requested_pps: u32,
        in_use_pps: u32,
        ceiling_pps: u32,
    },
    InvalidRate(u32),
    NotFound(String),
    LaunchFailed(String),
    StorageError(StorageError),
    ProbeError(ProbeError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::CapacityExceeded {
                requested_pps,
                in_use_pps,
                ceiling_pps,
            } => write!(
                f,
                "Rate budget exceeded: requested {} pps with {} pps in use against a {} pps ceiling",
                requested_pps, in_use_pps, ceiling_pps
            ),
            OrchestratorError::InvalidRate(r) => write!(f, "Invalid packet rate: {} pps", r),
            OrchestratorError::NotFound(id) => write!(f, "No running session with id {}", id),
            OrchestratorError::LaunchFailed(e) => write!(f, "Probe launch failed: {}", e),
            OrchestratorError::StorageError(e) => write!(f, "Storage error: {}", e),
            OrchestratorError::ProbeError(e) => write!(f, "Probe error: {}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        OrchestratorError::StorageError(err)
    }
}

impl From<ProbeError> for OrchestratorError {
    fn from(err: ProbeError) -> Self {
        OrchestratorError::ProbeError(err)
    }
}
