use crate::storage::StorageError;
use miette::Diagnostic;
use thiserror::Error;

/**
 * 仓库错误类型 - 使用 miette 提供用户友好的错误诊断
 *
 * 同一次同步尝试的结果会分发给所有等待者，因此该类型必须实现 `Clone`：
 * 所有变体只携带可克隆的字符串信息
 */
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("Storage unavailable: {0}")]
    #[diagnostic(
        code(repo::storage_unavailable),
        help("The storage backend could not be reached; the next refresh will retry")
    )]
    StorageUnavailable(String),

    #[error("Permission denied: {0}")]
    #[diagnostic(
        code(repo::permission_denied),
        help("Check the credentials and access policy of the storage backend")
    )]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(repo::not_found))]
    NotFound(String),

    #[error("Malformed artifact {path}: {reason}")]
    #[diagnostic(code(repo::malformed_artifact))]
    MalformedArtifact { path: String, reason: String },

    #[error("Index build failed: {0}")]
    #[diagnostic(code(repo::index_build_failed))]
    IndexBuildFailed(String),

    #[error("Tenant not found: {0}")]
    #[diagnostic(code(repo::tenant_not_found))]
    TenantNotFound(String),

    #[error("Invalid tenant key: {0}")]
    #[diagnostic(
        code(repo::invalid_tenant_key),
        help("Tenant keys are 1-64 characters of letters, digits, '-' or '_'")
    )]
    InvalidTenantKey(String),

    #[error("Object already exists: {0}")]
    #[diagnostic(
        code(repo::already_exists),
        help("Delete the existing version first or enable allow_overwrite")
    )]
    AlreadyExists(String),

    #[error("Invalid package: {0}")]
    #[diagnostic(code(repo::invalid_package))]
    InvalidPackage(String),

    #[error("Timeout error: {0}")]
    #[diagnostic(code(repo::timeout))]
    Timeout(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(repo::config_error))]
    Config(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(repo::internal_error))]
    Internal(String),
}

impl RepoError {
    /**
     * 为错误添加上下文信息
     */
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            RepoError::StorageUnavailable(msg) => {
                RepoError::StorageUnavailable(format!("{}: {}", context, msg))
            }
            RepoError::IndexBuildFailed(msg) => {
                RepoError::IndexBuildFailed(format!("{}: {}", context, msg))
            }
            RepoError::Internal(msg) => RepoError::Internal(format!("{}: {}", context, msg)),
            other => other,
        }
    }

    /**
     * 创建畸形制品错误
     */
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RepoError::MalformedArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /**
     * 创建未找到错误
     */
    pub fn not_found(message: impl Into<String>) -> Self {
        RepoError::NotFound(message.into())
    }

    /**
     * 创建内部错误
     */
    pub fn internal(message: impl Into<String>) -> Self {
        RepoError::Internal(message.into())
    }

    /**
     * 是否为暂时性错误（下一次触发即可重试）
     */
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::StorageUnavailable(_) | RepoError::Timeout(_))
    }
}

impl From<StorageError> for RepoError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(path) => RepoError::NotFound(path),
            StorageError::PermissionDenied(msg) => RepoError::PermissionDenied(msg),
            StorageError::Unavailable(msg) => RepoError::StorageUnavailable(msg),
            StorageError::Malformed(msg) => RepoError::StorageUnavailable(format!(
                "malformed listing: {}",
                msg
            )),
        }
    }
}

/**
 * 统一结果类型
 */
pub type Result<T> = std::result::Result<T, RepoError>;

/**
 * 内部结果类型 - 使用 eyre 进行错误传播（入口程序使用）
 */
pub type EyreResult<T> = eyre::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = RepoError::malformed("foo.tgz", "missing version");
        assert!(matches!(error, RepoError::MalformedArtifact { .. }));

        let error = RepoError::not_found("foo-1.0.0.tgz");
        assert!(matches!(error, RepoError::NotFound(_)));
    }

    #[test]
    fn test_error_with_context() {
        let error = RepoError::StorageUnavailable("connection refused".to_string());
        let with_context = error.with_context("tenant org1");

        if let RepoError::StorageUnavailable(message) = with_context {
            assert!(message.contains("tenant org1"));
            assert!(message.contains("connection refused"));
        } else {
            panic!("Expected StorageUnavailable variant");
        }
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: RepoError = StorageError::PermissionDenied("bucket".to_string()).into();
        assert_eq!(err, RepoError::PermissionDenied("bucket".to_string()));

        let err: RepoError = StorageError::Unavailable("503".to_string()).into();
        assert!(err.is_transient());

        let err: RepoError = StorageError::NotFound("a.tgz".to_string()).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_display() {
        let error = RepoError::TenantNotFound("org9".to_string());
        let display = format!("{}", error);
        assert!(display.contains("Tenant not found"));
        assert!(display.contains("org9"));
    }
}
