use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error_handling::types::ConfigError;

/// Runtime configuration for the orchestrator and the file projections it
/// shares with probe instances.
///
/// All paths default to a directory under `/tmp` so a freshly started
/// orchestrator can pick up snapshot files left behind by instances it did
/// not itself start.
///
/// # Fields Overview
///
/// - `stats_dir`: directory holding one live-stats JSON file per running
///   probe instance
/// - `history_file`: append-only JSON Lines log of completed sessions
/// - `counter_file`: durable rotating test-id counter
/// - `max_total_pps`: global packet-rate ceiling across all concurrently
///   running instances
/// - `stop_timeout_secs`: how long to wait for a cooperative stop before
///   escalating to a forced kill
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stats_dir: PathBuf,
    pub history_file: PathBuf,
    pub counter_file: PathBuf,
    pub max_total_pps: u32,
    pub stop_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let base = PathBuf::from("/tmp/pathprobe");
        Self {
            stats_dir: base.clone(),
            history_file: base.join("convergence-history.jsonl"),
            counter_file: base.join("convergence-counter.json"),
            max_total_pps: 1000,
            stop_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file. Missing keys fall back to
    /// their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total_pps == 0 {
            return Err(ConfigError::BadRateCeiling(
                "max_total_pps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_total_pps, 1000);
        assert_eq!(config.stats_dir, PathBuf::from("/tmp/pathprobe"));
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_total_pps = 250").unwrap();
        writeln!(file, "stats_dir = \"/var/run/pathprobe\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.max_total_pps, 250);
        assert_eq!(config.stats_dir, PathBuf::from("/var/run/pathprobe"));
        // untouched keys keep their defaults
        assert_eq!(config.stop_timeout_secs, 5);
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_total_pps = 0").unwrap();

        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::BadRateCeiling(_))
        ));
    }
}
