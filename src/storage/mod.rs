//! Object Storage Backends
//!
//! The repository never talks to a concrete store directly. Everything goes
//! through [`StorageBackend`], an async object-store interface keyed by
//! slash-separated paths:
//!
//! ```text
//! <prefix>/                 # tenant prefix ("" for the single-tenant root)
//! ├── mychart-1.0.0.tgz     # package archive
//! └── mychart-1.0.0.tgz.prov  # detached provenance signature
//! ```
//!
//! Listings are non-recursive and return paths relative to the prefix, so a
//! root listing never sees objects that belong to tenant prefixes.
//!
//! Two backends ship with the crate: [`MemoryBackend`] for tests and
//! ephemeral servers, and [`LocalFilesystemBackend`] for a directory on disk.

pub mod local;
pub mod memory;


use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use local::LocalFilesystemBackend;
pub use memory::MemoryBackend;

/// File suffix of chart package archives
pub const PACKAGE_SUFFIX: &str = ".tgz";
/// File suffix of detached provenance signatures
pub const PROVENANCE_SUFFIX: &str = ".tgz.prov";

/// Errors reported by a storage backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed listing: {0}")]
    Malformed(String),
}

impl StorageError {
    /// Map an I/O error onto the storage taxonomy
    pub fn from_io(error: &std::io::Error, path: &str) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(format!("{}: {}", path, error))
            }
            _ => StorageError::Unavailable(format!("{}: {}", path, error)),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One object as reported by a listing
///
/// `path` is relative to the listed prefix. Values are never mutated after
/// a listing produced them; a new listing produces new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Content identifier (lowercase SHA-256 hex for the bundled backends)
    pub etag: String,
}

impl StorageObject {
    /// Last path segment
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Whether this object is a chart package archive
    pub fn is_package(&self) -> bool {
        is_package_name(self.file_name())
    }

    /// Whether this object is a provenance file accompanying a package
    pub fn is_provenance(&self) -> bool {
        self.file_name().ends_with(PROVENANCE_SUFFIX)
    }
}

pub fn is_package_name(file_name: &str) -> bool {
    file_name.ends_with(PACKAGE_SUFFIX) && file_name.len() > PACKAGE_SUFFIX.len()
}

/// Object-store interface consumed by the repository
///
/// Implementations must be safe to call concurrently. `list` is the only
/// call the coordinator coalesces; `get`/`put`/`delete` are issued directly
/// by the upload and download paths.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// List the direct children of `prefix`, paths relative to it
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>>;

    async fn get(&self, path: &str) -> StorageResult<Bytes>;

    /// Create or replace the object at `path`
    async fn put(&self, path: &str, content: Bytes) -> StorageResult<()>;

    async fn delete(&self, path: &str) -> StorageResult<()>;
}

/// Join a tenant prefix and a relative path
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_start_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// Compute the lowercase SHA-256 hex digest used as content identifier
pub fn compute_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Split a full path into (parent prefix, file name)
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}
