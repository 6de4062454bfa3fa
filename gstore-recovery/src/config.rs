//! Recovery configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GSTORE_CONFIG or --config)
//! 3. Environment variables

use gstore_log::{LogFiles, DEFAULT_LOG_PREFIX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default name of the quarantine directory inside the store directory.
pub const DEFAULT_QUARANTINE_DIR: &str = "corrupted-logs";

/// Recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Store directory.
    pub store_dir: PathBuf,
    /// Directory holding the transaction logs. Defaults to `store_dir`.
    pub log_dir: Option<PathBuf>,
    /// Log file name prefix.
    pub log_prefix: String,
    /// Quarantine directory, relative to `store_dir` unless absolute.
    pub quarantine_dir: PathBuf,
    /// Refuse to recover a corrupt tail instead of truncating it.
    pub fail_on_corrupted_log_files: bool,
    /// Skip the check that the logs belong to this store.
    pub ignore_store_id_validation: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./data"),
            log_dir: None,
            log_prefix: DEFAULT_LOG_PREFIX.to_string(),
            quarantine_dir: PathBuf::from(DEFAULT_QUARANTINE_DIR),
            fail_on_corrupted_log_files: false,
            ignore_store_id_validation: false,
        }
    }
}

impl RecoveryConfig {
    /// Configuration for a store directory with every other value defaulted.
    pub fn for_store(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("GSTORE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: RecoveryConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("GSTORE_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("GSTORE_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }

        if let Ok(prefix) = std::env::var("GSTORE_LOG_PREFIX") {
            if !prefix.is_empty() {
                self.log_prefix = prefix;
            }
        }

        if let Ok(dir) = std::env::var("GSTORE_QUARANTINE_DIR") {
            self.quarantine_dir = PathBuf::from(dir);
        }

        if let Ok(strict) = std::env::var("GSTORE_FAIL_ON_CORRUPTED_LOGS") {
            self.fail_on_corrupted_log_files = strict == "1" || strict.to_lowercase() == "true";
        }

        if let Ok(ignore) = std::env::var("GSTORE_IGNORE_STORE_ID") {
            self.ignore_store_id_validation = ignore == "1" || ignore.to_lowercase() == "true";
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "log_prefix must not be empty".to_string(),
            ));
        }
        if self.log_prefix.contains(std::path::is_separator) {
            return Err(ConfigError::ValidationError(format!(
                "log_prefix '{}' must not contain a path separator",
                self.log_prefix
            )));
        }
        Ok(())
    }

    /// Returns the log directory path.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.store_dir.clone())
    }

    /// Returns the quarantine directory path.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.store_dir.join(&self.quarantine_dir)
    }

    /// Returns the log file set described by this configuration.
    pub fn log_files(&self) -> LogFiles {
        LogFiles::new(self.log_dir(), self.log_prefix.clone())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = RecoveryConfig::default();
        assert_eq!(config.log_prefix, "transaction.db");
        assert!(!config.fail_on_corrupted_log_files);
        assert!(!config.ignore_store_id_validation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths() {
        let config = RecoveryConfig::for_store("/var/lib/gstore");
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/gstore"));
        assert_eq!(
            config.quarantine_dir(),
            PathBuf::from("/var/lib/gstore/corrupted-logs")
        );

        let config = RecoveryConfig {
            log_dir: Some(PathBuf::from("/fast/logs")),
            ..config
        };
        assert_eq!(config.log_files().dir(), Path::new("/fast/logs"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gstore.yaml");
        std::fs::write(
            &path,
            "store_dir: /srv/graph\nfail_on_corrupted_log_files: true\n",
        )
        .unwrap();

        let config = RecoveryConfig::from_file(&path).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/srv/graph"));
        assert!(config.fail_on_corrupted_log_files);
        assert_eq!(config.quarantine_dir, PathBuf::from(DEFAULT_QUARANTINE_DIR));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gstore.yaml");
        let config = RecoveryConfig {
            log_prefix: "neo".to_string(),
            ..RecoveryConfig::default()
        };
        config.save(&path).unwrap();
        let parsed = RecoveryConfig::from_file(&path).unwrap();
        assert_eq!(parsed.log_prefix, "neo");
    }

    #[test]
    fn test_invalid_prefix() {
        let config = RecoveryConfig {
            log_prefix: "a/b".to_string(),
            ..RecoveryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
