//! Configuration
//!
//! Layered like the rest of the crate:
//! - statistics (process-wide accumulator settings)
//! - storage (SQLite cache database)
//! - calculation (storage resolutions, per-key locking)
//! - logging
//!
//! Every field has a default, so a partial TOML/JSON file is enough.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::pad::accumulator::{self, DEFAULT_CONFIDENCE_LEVEL};
use crate::pad::PadLevel;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub statistics: StatisticsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub calculation: CalculationConfig,

    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StatisticsConfig {
    /// Two-sided confidence level of accumulator confidence intervals
    #[serde(default = "default_confidence_level")]
    #[validate(range(min = 0.5, max = 0.9999))]
    pub confidence_level: f64,
}

fn default_confidence_level() -> f64 {
    DEFAULT_CONFIDENCE_LEVEL
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            confidence_level: default_confidence_level(),
        }
    }
}

/// Cache database
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_database_file")]
    #[validate(length(min = 1, max = 255))]
    pub database_file: String,

    #[serde(default = "default_min_connections")]
    #[validate(range(min = 1, max = 64))]
    pub min_connections: u32,

    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1, max = 64))]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub acquire_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database_file() -> String {
    "calc_cache.db".to_string()
}

fn default_min_connections() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl StorageConfig {
    /// Storage rooted at `data_dir`, everything else defaulted
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Load-or-calculate behaviour
///
/// A resolution is the lowest pad level kept when a computed tree is
/// persisted; everything below it is dropped after its accumulators are
/// frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationConfig {
    #[serde(default = "default_corr_interval_resolution")]
    pub corr_interval_resolution: PadLevel,

    #[serde(default = "default_replicate_resolution")]
    pub replicate_resolution: PadLevel,

    #[serde(default = "default_sample_resolution")]
    pub sample_resolution: PadLevel,

    /// Serialise concurrent computations of the same cache key
    #[serde(default = "default_per_key_locking")]
    pub per_key_locking: bool,
}

fn default_corr_interval_resolution() -> PadLevel {
    PadLevel::Acquisition
}

fn default_replicate_resolution() -> PadLevel {
    PadLevel::Cycle
}

fn default_sample_resolution() -> PadLevel {
    PadLevel::Replicate
}

fn default_per_key_locking() -> bool {
    true
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            corr_interval_resolution: default_corr_interval_resolution(),
            replicate_resolution: default_replicate_resolution(),
            sample_resolution: default_sample_resolution(),
            per_key_locking: default_per_key_locking(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    #[validate(length(min = 1, max = 200))]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Directory of the daily rolling log file, console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_file_prefix")]
    #[validate(length(min = 1, max = 100))]
    pub file_prefix: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "isocalc.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl AppConfig {
    /// Load and validate a TOML configuration file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = read_config(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            AppError::Config(format!(
                "Failed to parse TOML config {}: {}",
                path.display(),
                e
            ))
        })?;
        config.check()?;

        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = read_config(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            AppError::Config(format!(
                "Failed to parse JSON config {}: {}",
                path.display(),
                e
            ))
        })?;
        config.check()?;

        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn save_to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            AppError::io_error(
                format!("Failed to write config file: {}", e),
                Some(path.to_path_buf()),
            )
        })?;
        Ok(())
    }

    /// Field-level validation plus cross-field rules
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))?;

        if self.storage.min_connections > self.storage.max_connections {
            return Err(AppError::Config(format!(
                "storage.min_connections ({}) exceeds storage.max_connections ({})",
                self.storage.min_connections, self.storage.max_connections
            )));
        }
        Ok(())
    }

    /// Seed the process-wide confidence level used by accumulators
    pub fn apply_statistics(&self) {
        accumulator::set_confidence_level(self.statistics.confidence_level);
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        AppError::io_error(
            format!("Failed to read config file: {}", e),
            Some(path.to_path_buf()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.statistics.confidence_level, 0.95);
        assert_eq!(config.calculation.sample_resolution, PadLevel::Replicate);
        assert!(config.calculation.per_key_locking);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("isocalc.toml");
        std::fs::write(
            &path,
            r#"
[statistics]
confidence_level = 0.99

[calculation]
corr_interval_resolution = "replicate"
"#,
        )
        .unwrap();

        let config = AppConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.statistics.confidence_level, 0.99);
        assert_eq!(config.calculation.corr_interval_resolution, PadLevel::Replicate);
        assert_eq!(config.calculation.replicate_resolution, PadLevel::Cycle);
        assert_eq!(config.storage.database_file, "calc_cache.db");
    }

    #[test]
    fn test_json_round_trip_through_toml() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("isocalc.json");
        std::fs::write(&json_path, r#"{"logging": {"level": "debug", "json": true}}"#).unwrap();

        let config = AppConfig::from_json_file(&json_path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);

        let toml_path = dir.path().join("saved.toml");
        config.save_to_toml(&toml_path).unwrap();
        let reloaded = AppConfig::from_toml_file(&toml_path).unwrap();
        assert_eq!(reloaded.logging.level, "debug");
    }

    #[rstest]
    #[case(0.3)]
    #[case(1.0)]
    fn test_confidence_level_out_of_range(#[case] level: f64) {
        let mut config = AppConfig::default();
        config.statistics.confidence_level = level;
        assert!(matches!(config.check(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_pool_bounds_are_checked() {
        let mut config = AppConfig::default();
        config.storage.min_connections = 8;
        config.storage.max_connections = 2;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = AppConfig::from_toml_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(AppError::IoDetailed { .. })));
    }
}
