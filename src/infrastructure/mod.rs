//! Infrastructure layer - configuration and logging

pub mod config;
pub mod logging;

pub use config::{AppConfig, CalculationConfig, LoggingConfig, StatisticsConfig, StorageConfig};
pub use logging::init_logging;
