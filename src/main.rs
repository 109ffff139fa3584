//! Chart Depot - 主入口
//!
//! 负责：
//! - 加载配置（`CHART_DEPOT_CONFIG` 指定的 TOML 文件 + 环境变量）
//! - 初始化日志系统
//! - 构建本地文件系统后端与仓库服务
//! - 预热单租户索引并启动定时刷新
//! - 等待 Ctrl+C 后优雅退出

use chart_depot::error::EyreResult;
use chart_depot::infrastructure::{init_logging, AppConfig};
use chart_depot::{ChartRepository, LocalFilesystemBackend, RefreshScheduler, RepositoryOptions};
use eyre::WrapErr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> EyreResult<()> {
    let config_path = std::env::var_os("CHART_DEPOT_CONFIG").map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).wrap_err("failed to load configuration")?;

    // 初始化日志（guard 需要存活到进程结束）
    let _log_guard = init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = %config.storage.local_dir,
        multi_tenancy = config.server.multi_tenancy,
        "Chart Depot starting"
    );

    let backend = Arc::new(LocalFilesystemBackend::new(&config.storage.local_dir));
    let repository = Arc::new(ChartRepository::new(
        RepositoryOptions::from_config(&config),
        backend,
    ));

    repository
        .prime()
        .await
        .wrap_err("failed to prime the repository index")?;

    let scheduler = RefreshScheduler::start(Arc::clone(&repository), config.sync.refresh_interval());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    scheduler.shutdown().await;
    Ok(())
}
