//! 基础设施层 - 配置与日志

pub mod config;
pub mod logging;

pub use config::{AppConfig, ConfigError, LoggingConfig, ServerConfig, StorageConfig, SyncConfig};
pub use logging::init_logging;
