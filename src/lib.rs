//! Chart Depot - 图表仓库服务核心
//!
//! 将对象存储中的图表包（`.tgz`）及其签名文件（`.tgz.prov`）整理为可查询的
//! 仓库索引，并在并发的上传、删除、定时刷新下保持索引与存储一致：
//!
//! - [`storage`]: 对象存储抽象与内置后端
//! - [`repo`]: 对象缓存、索引构建、单飞同步协调、多租户注册表
//! - [`services`]: 面向上层的仓库服务与索引编码
//! - [`scheduler`]: 定时刷新 Actor
//! - [`infrastructure`]: 配置与日志

pub mod error;
pub mod infrastructure;
pub mod repo;
pub mod scheduler;
pub mod services;
pub mod storage;

pub use error::{RepoError, Result};
pub use repo::{
    ChartVersion, RegenerationCoordinator, RepositoryIndex, SyncResult, SyncSettings,
    TenancyRegistry, TenantKey,
};
pub use scheduler::RefreshScheduler;
pub use services::{ChartRepository, RepositoryOptions};
pub use storage::{LocalFilesystemBackend, MemoryBackend, StorageBackend, StorageError, StorageObject};
