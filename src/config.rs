//! Configuration file support for toolroute
//!
//! Reads from .toolroute/config.toml, found by walking up from the
//! current directory. Environment variables override file values.

use crate::db::PrivacyLevel;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the per-project directory holding config, registry and telemetry
pub const CONFIG_DIR: &str = ".toolroute";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Telemetry settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where agents.yaml, tools.yaml, models.yaml and policies.yaml live
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Directory relative paths resolve against (the .toolroute dir)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Telemetry-related configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TelemetryConfig {
    /// SQLite ledger path. Default: .toolroute/telemetry.db
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// JSONL event log path. Default: .toolroute/events.jsonl
    #[serde(default)]
    pub events_path: Option<PathBuf>,

    /// Rotate the event log once it reaches this many bytes
    #[serde(default)]
    pub rotate_bytes: Option<u64>,

    /// How much of each prompt the ledger keeps
    #[serde(default)]
    pub privacy_level: PrivacyLevel,

    /// Invocation rows older than this are eligible for `purge`
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// tracing filter directive, e.g. "info" or "toolroute=debug"
    /// Default: "warn"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load config from .toolroute/config.toml
    /// Returns default config if file doesn't exist or can't be parsed
    pub fn load() -> Self {
        let base_dir = Self::find_config_dir().unwrap_or_else(|| PathBuf::from(CONFIG_DIR));
        let path = base_dir.join("config.toml");
        if path.exists() {
            if let Ok(config) = Self::load_from(&path) {
                return config;
            }
        }
        Self {
            base_dir,
            ..Self::default()
        }
    }

    /// Load a specific config file; relative paths resolve against its directory
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Find the .toolroute directory by walking up the directory tree
    fn find_config_dir() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let candidate = dir.join(CONFIG_DIR);
            if candidate.is_dir() {
                return Some(candidate);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Ledger path; TOOLROUTE_DB_PATH always takes priority
    pub fn db_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var("TOOLROUTE_DB_PATH") {
            return PathBuf::from(path);
        }
        match &self.telemetry.db_path {
            Some(p) => self.resolve(p),
            None => self.base_dir.join("telemetry.db"),
        }
    }

    /// Event log path; TOOLROUTE_EVENTS_PATH always takes priority
    pub fn events_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var("TOOLROUTE_EVENTS_PATH") {
            return PathBuf::from(path);
        }
        match &self.telemetry.events_path {
            Some(p) => self.resolve(p),
            None => self.base_dir.join("events.jsonl"),
        }
    }

    /// Registry directory; TOOLROUTE_REGISTRY_DIR always takes priority
    pub fn registry_dir(&self) -> PathBuf {
        if let Ok(path) = std::env::var("TOOLROUTE_REGISTRY_DIR") {
            return PathBuf::from(path);
        }
        match &self.registry.dir {
            Some(p) => self.resolve(p),
            None => self.base_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.telemetry.privacy_level, PrivacyLevel::Standard);
        assert!(config.telemetry.rotate_bytes.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[telemetry]
db_path = "data/ledger.db"
rotate_bytes = 1048576
privacy_level = "minimal"
retention_days = 30

[logging]
level = "toolroute=debug"
"#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.base_dir = PathBuf::from("/project/.toolroute");
        assert_eq!(config.telemetry.rotate_bytes, Some(1_048_576));
        assert_eq!(config.telemetry.privacy_level, PrivacyLevel::Minimal);
        assert_eq!(config.telemetry.retention_days, Some(30));
        assert_eq!(config.logging.level, "toolroute=debug");
        assert_eq!(
            config.resolve(config.telemetry.db_path.as_ref().unwrap()),
            PathBuf::from("/project/.toolroute/data/ledger.db")
        );
    }

    #[test]
    fn test_load_from_sets_base_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\ndir = \"registry\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.registry.dir, Some(PathBuf::from("registry")));
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[telemetry\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }
}
