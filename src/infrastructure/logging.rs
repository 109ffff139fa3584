//! 日志初始化
//!
//! `RUST_LOG` 优先；未设置时根据 `logging.debug` 选择默认级别。
//! 配置了日志目录时按天滚动写入文件，否则写到 stderr。

use super::config::LoggingConfig;
use crate::error::{RepoError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "chart-depot.log";

fn default_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.debug {
            EnvFilter::new("chart_depot=debug,info")
        } else {
            EnvFilter::new("chart_depot=info,warn")
        }
    })
}

/// 初始化全局 tracing subscriber
///
/// 返回的 guard 必须保持存活直到进程退出，否则文件日志可能丢失。
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (writer, guard) = match config.directory.as_deref() {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|e| {
                RepoError::Config(format!("cannot create log directory {}: {}", directory, e))
            })?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let ansi = config.directory.is_none();

    let registry = tracing_subscriber::registry().with(default_filter(config));
    let installed = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init()
    };

    installed.map_err(|e| RepoError::Config(format!("cannot install log subscriber: {}", e)))?;
    Ok(guard)
}
