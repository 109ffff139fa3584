//! Local filesystem storage backend
//!
//! Maps object paths onto a directory tree:
//!
//! ```text
//! root/
//!   mychart-1.0.0.tgz        # single-tenant objects
//!   org1/
//!     other-0.2.0.tgz        # tenant "org1"
//! ```
//!
//! - SHA-256 content hashing as the object etag
//! - Digest cache keyed by (path, mtime, size) so unchanged files are not
//!   re-hashed on every listing
//! - Atomic writes through a temporary file and rename
//! - Every filesystem operation is bounded by a timeout

use super::{compute_digest, StorageBackend, StorageError, StorageObject, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IO_TIMEOUT: Duration = Duration::from_secs(60);
const HASH_BUFFER_SIZE: usize = 8 * 1024; // 8KB buffer

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedDigest {
    modified: SystemTime,
    size: u64,
    digest: String,
}

/// Directory-backed object store
#[derive(Debug, Clone)]
pub struct LocalFilesystemBackend {
    root: PathBuf,
    digest_cache: Arc<DashMap<PathBuf, CachedDigest>>,
}

impl LocalFilesystemBackend {
    /// Create a backend rooted at `root`; the directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            digest_cache: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path below the root, rejecting escapes
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::PermissionDenied(format!(
                "path escapes storage root: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Stream a file through SHA-256 (blocking)
    fn hash_file(path: &Path) -> std::io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Blocking listing of the direct children of `dir`
    fn list_blocking(
        dir: &Path,
        cache: &DashMap<PathBuf, CachedDigest>,
    ) -> StorageResult<Vec<StorageObject>> {
        let display = dir.display().to_string();
        if !dir.exists() {
            cache.retain(|path, _| path.parent() != Some(dir));
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let mut seen = HashSet::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| match e.io_error() {
                Some(io) => StorageError::from_io(io, &display),
                None => StorageError::Malformed(format!("{}: {}", display, e)),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // 写入中的临时文件
            if name.starts_with('.') {
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| StorageError::Unavailable(format!("{}: {}", name, e)))?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let size = metadata.len();

            let path = entry.path().to_path_buf();
            seen.insert(path.clone());
            let digest = match cache.get(&path) {
                Some(cached) if cached.modified == modified && cached.size == size => {
                    cached.digest.clone()
                }
                _ => {
                    let digest = Self::hash_file(&path)
                        .map_err(|e| StorageError::from_io(&e, &name))?;
                    cache.insert(
                        path,
                        CachedDigest {
                            modified,
                            size,
                            digest: digest.clone(),
                        },
                    );
                    digest
                }
            };

            objects.push(StorageObject {
                path: name,
                size,
                last_modified: DateTime::<Utc>::from(modified),
                etag: digest,
            });
        }

        // 外部删除的文件不再占用缓存
        cache.retain(|path, _| path.parent() != Some(dir) || seen.contains(path));
        Ok(objects)
    }
}

#[async_trait]
impl StorageBackend for LocalFilesystemBackend {
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        let dir = self.resolve(prefix)?;
        let cache = Arc::clone(&self.digest_cache);
        let dir_for_task = dir.clone();

        let listing = tokio::time::timeout(
            IO_TIMEOUT,
            tokio::task::spawn_blocking(move || Self::list_blocking(&dir_for_task, &cache)),
        )
        .await
        .map_err(|_| {
            StorageError::Unavailable(format!(
                "listing {} timed out after {:?}",
                dir.display(),
                IO_TIMEOUT
            ))
        })?
        .map_err(|e| StorageError::Unavailable(format!("listing task failed: {}", e)))??;

        debug!(
            dir = %dir.display(),
            objects = listing.len(),
            "Listed local storage"
        );
        Ok(listing)
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        let file_path = self.resolve(path)?;
        let content = tokio::time::timeout(IO_TIMEOUT, fs::read(&file_path))
            .await
            .map_err(|_| StorageError::Unavailable(format!("reading {} timed out", path)))?
            .map_err(|e| StorageError::from_io(&e, path))?;
        Ok(Bytes::from(content))
    }

    async fn put(&self, path: &str, content: Bytes) -> StorageResult<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::Malformed(format!("no file name in {}", path)))?;
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let write = async {
            fs::create_dir_all(&parent).await?;
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&content).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &target).await
        };

        match tokio::time::timeout(IO_TIMEOUT, write).await {
            Ok(Ok(())) => {
                info!(
                    path = %path,
                    size = content.len(),
                    digest = %compute_digest(&content),
                    "Stored object on local filesystem"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::from_io(&e, path))
            }
            Err(_) => {
                if let Err(e) = fs::remove_file(&temp_path).await {
                    warn!(
                        path = %temp_path.display(),
                        error = %e,
                        "Failed to clean up partial file after timeout"
                    );
                }
                Err(StorageError::Unavailable(format!(
                    "writing {} timed out after {:?}",
                    path, IO_TIMEOUT
                )))
            }
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let file_path = self.resolve(path)?;
        tokio::time::timeout(IO_TIMEOUT, fs::remove_file(&file_path))
            .await
            .map_err(|_| StorageError::Unavailable(format!("deleting {} timed out", path)))?
            .map_err(|e| StorageError::from_io(&e, path))?;
        self.digest_cache.remove(&file_path);
        debug!(path = %path, "Deleted object from local filesystem");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path());

        backend
            .put("org1/foo-1.0.0.tgz", Bytes::from_static(b"chart bytes"))
            .await
            .unwrap();
        let content = backend.get("org1/foo-1.0.0.tgz").await.unwrap();
        assert_eq!(&content[..], b"chart bytes");
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path().join("never-created"));

        let listing = backend.list("org1").await.unwrap();
        assert!(listing.is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_directories_and_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path());

        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"a")).await.unwrap();
        backend.put("org1/bar-1.0.0.tgz", Bytes::from_static(b"b")).await.unwrap();
        std::fs::write(temp_dir.path().join(".partial.tmp"), b"x").unwrap();

        let listing = backend.list("").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, "foo-1.0.0.tgz");
        assert_eq!(listing[0].etag, compute_digest(b"a"));
        assert_eq!(listing[0].size, 1);
    }

    #[tokio::test]
    async fn test_digest_cache_refreshes_on_change() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path());

        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"v1")).await.unwrap();
        let first = backend.list("").await.unwrap();

        backend
            .put("foo-1.0.0.tgz", Bytes::from_static(b"version two"))
            .await
            .unwrap();
        let second = backend.list("").await.unwrap();

        assert_eq!(first[0].etag, compute_digest(b"v1"));
        assert_eq!(second[0].etag, compute_digest(b"version two"));
    }

    #[tokio::test]
    async fn test_digest_cache_forgets_removed_files() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path());

        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"a")).await.unwrap();
        backend.put("org1/bar-1.0.0.tgz", Bytes::from_static(b"b")).await.unwrap();
        backend.list("").await.unwrap();
        backend.list("org1").await.unwrap();
        assert_eq!(backend.digest_cache.len(), 2);

        // 绕过后端直接删除
        std::fs::remove_file(temp_dir.path().join("foo-1.0.0.tgz")).unwrap();
        assert!(backend.list("").await.unwrap().is_empty());
        assert_eq!(backend.digest_cache.len(), 1);

        std::fs::remove_dir_all(temp_dir.path().join("org1")).unwrap();
        assert!(backend.list("org1").await.unwrap().is_empty());
        assert!(backend.digest_cache.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path());

        let result = backend.get("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_delete_then_get_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFilesystemBackend::new(temp_dir.path());

        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"a")).await.unwrap();
        backend.delete("foo-1.0.0.tgz").await.unwrap();

        assert!(matches!(
            backend.get("foo-1.0.0.tgz").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete("foo-1.0.0.tgz").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
