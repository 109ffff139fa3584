//! 配置管理基础设施层
//!
//! 配置来源按优先级从低到高：
//! - 内置默认值
//! - TOML 配置文件（可选）
//! - `CHART_DEPOT__<SECTION>__<KEY>` 环境变量

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::repo::SyncSettings;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "CHART_DEPOT";

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置验证失败: {0}")]
    Validation(String),

    #[error("配置文件不存在: {0}")]
    FileNotFound(PathBuf),

    #[error("配置文件格式错误: {0}")]
    FormatError(String),
}

impl From<ConfigError> for crate::error::RepoError {
    fn from(error: ConfigError) -> Self {
        crate::error::RepoError::Config(error.to_string())
    }
}

/// 全局配置根结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub storage: StorageConfig,

    #[validate(nested)]
    pub sync: SyncConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// 下载地址根路径；为空时索引中使用相对地址
    #[validate(custom(function = "validate_chart_url"))]
    pub chart_url: String,

    /// 允许覆盖已存在的版本
    pub allow_overwrite: bool,

    /// 启用多租户（按请求路径首段区分租户）
    pub multi_tenancy: bool,
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    #[validate(length(min = 1, max = 500))]
    pub local_dir: String,
}

/// 同步配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SyncConfig {
    #[validate(range(min = 1, max = 3600))]
    pub listing_timeout_secs: u64,

    #[validate(range(min = 1, max = 3600))]
    pub sync_timeout_secs: u64,

    /// 定时刷新间隔，0 表示禁用
    #[validate(range(max = 86400))]
    pub refresh_interval_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// 输出 JSON 格式日志
    pub json: bool,

    /// 启用 debug 级别日志
    pub debug: bool,

    /// 日志文件目录（按天滚动）；为空时输出到 stderr
    #[validate(length(min = 1, max = 500))]
    pub directory: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chart_url: String::new(),
            allow_overwrite: false,
            multi_tenancy: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_dir: "./charts".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listing_timeout_secs: 30,
            sync_timeout_secs: 60,
            refresh_interval_secs: 0,
        }
    }
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            listing_timeout: Duration::from_secs(self.listing_timeout_secs),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
        }
    }

    /// 定时刷新间隔；禁用时返回 `None`
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

fn validate_chart_url(url: &str) -> Result<(), ValidationError> {
    if url.is_empty() {
        return Ok(());
    }
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ValidationError::new("chart_url_scheme"))?;
    if host.trim_matches('/').is_empty() || host.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("chart_url_host"));
    }
    Ok(())
}

impl AppConfig {
    /// 加载配置：默认值 + 可选配置文件 + 环境变量
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// `env` 为 `None` 时读取进程环境变量
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| ConfigError::FormatError(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let loaded: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::FormatError(e.to_string()))?;

        loaded
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(loaded)
    }
}
