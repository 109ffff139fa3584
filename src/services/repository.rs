//! 仓库服务
//!
//! [`ChartRepository`] 是上层（HTTP 路由等）调用的入口：
//! - 写操作（上传、删除）写入存储后触发一次索引同步
//! - 读操作直接读取已发布的索引，不阻塞在同步上
//! - 首次访问某个租户时先等待一次同步，保证返回的不是空索引
//! - 只有写操作和刷新会创建租户状态，读操作不会

use crate::error::{RepoError, Result};
use crate::infrastructure::config::AppConfig;
use crate::repo::{
    parse_package_file_name, ChartVersion, RepositoryIndex, SemVer, SyncResult, SyncSettings,
    SyncStatus, TenancyRegistry, TenantKey, TenantState,
};
use crate::storage::{join_path, StorageBackend, StorageError, PACKAGE_SUFFIX, PROVENANCE_SUFFIX};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Options consumed by [`ChartRepository`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryOptions {
    pub chart_url: String,
    pub allow_overwrite: bool,
    pub multi_tenancy: bool,
    pub sync: SyncSettings,
}

impl RepositoryOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chart_url: config.server.chart_url.clone(),
            allow_overwrite: config.server.allow_overwrite,
            multi_tenancy: config.server.multi_tenancy,
            sync: config.sync.settings(),
        }
    }
}

/// Artifact kinds accepted on upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Package,
    Provenance,
}

/// Chart repository service
#[derive(Debug)]
pub struct ChartRepository {
    options: RepositoryOptions,
    backend: Arc<dyn StorageBackend>,
    registry: TenancyRegistry,
}

impl ChartRepository {
    pub fn new(options: RepositoryOptions, backend: Arc<dyn StorageBackend>) -> Self {
        let registry = TenancyRegistry::new(
            options.multi_tenancy,
            options.chart_url.clone(),
            Arc::clone(&backend),
            options.sync,
        );
        Self {
            options,
            backend,
            registry,
        }
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn registry(&self) -> &TenancyRegistry {
        &self.registry
    }

    /// Key addressing the single tenant when multi-tenancy is disabled
    pub fn default_tenant(&self) -> TenantKey {
        self.registry.default_key()
    }

    /// Startup sync of the implicit tenant
    ///
    /// Tenants under multi-tenancy are synced lazily on first access.
    pub async fn prime(&self) -> Result<()> {
        if self.options.multi_tenancy {
            info!("Multi-tenancy enabled, tenants are primed on first access");
            return Ok(());
        }
        let index = self.refresh(&self.default_tenant()).await?;
        info!(
            charts = index.chart_count(),
            versions = index.version_count(),
            "Repository primed"
        );
        Ok(())
    }

    fn validate_file_name(file_name: &str, kind: ArtifactKind) -> Result<()> {
        if file_name.is_empty()
            || file_name.starts_with('.')
            || !sanitize_filename::is_sanitized(file_name)
        {
            return Err(RepoError::InvalidPackage(format!(
                "'{}' is not a valid file name",
                file_name
            )));
        }

        let package_name = match kind {
            ArtifactKind::Package if !file_name.ends_with(PROVENANCE_SUFFIX) => {
                Some(file_name)
            }
            ArtifactKind::Provenance => file_name.strip_suffix(".prov"),
            _ => None,
        }
        .filter(|name| name.ends_with(PACKAGE_SUFFIX))
        .ok_or_else(|| {
            let expected = match kind {
                ArtifactKind::Package => PACKAGE_SUFFIX,
                ArtifactKind::Provenance => PROVENANCE_SUFFIX,
            };
            RepoError::InvalidPackage(format!("'{}' must end with {}", file_name, expected))
        })?;

        parse_package_file_name(package_name).map_err(RepoError::InvalidPackage)?;
        Ok(())
    }

    async fn store_artifact(
        &self,
        tenant: &TenantKey,
        file_name: &str,
        content: Bytes,
        kind: ArtifactKind,
    ) -> SyncResult {
        Self::validate_file_name(file_name, kind)?;
        if content.is_empty() {
            return Err(RepoError::InvalidPackage(format!("'{}' is empty", file_name)));
        }

        let state = self.registry.get_or_create(tenant)?;
        let path = join_path(tenant.storage_prefix(), file_name);
        let variants = match kind {
            ArtifactKind::Package => self.equal_versions(&state, file_name).await?,
            ArtifactKind::Provenance => Vec::new(),
        };

        if !self.options.allow_overwrite {
            if let Some(stored) = variants.first() {
                return Err(RepoError::AlreadyExists(format!(
                    "{} (same version as {})",
                    file_name, stored
                )));
            }
            match self.backend.get(&path).await {
                Ok(_) => return Err(RepoError::AlreadyExists(file_name.to_string())),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let size = content.len();
        self.backend.put(&path, content).await?;
        info!(tenant = %tenant, path = %path, size, kind = ?kind, "Artifact stored");

        // 覆盖上传：旧的同版本文件名及其签名一并删除
        for stored in &variants {
            let stored_path = join_path(tenant.storage_prefix(), stored);
            for victim in [stored_path.clone(), format!("{}.prov", stored_path)] {
                match self.backend.delete(&victim).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!(tenant = %tenant, replaced = %stored_path, path = %path, "Replaced equal version");
        }

        state.coordinator().sync_repository_index().await
    }

    /// Stored packages of the same chart under another file name whose
    /// version has the same precedence (`1.0.0`, `v1.0.0`, `1.0.0+build`)
    ///
    /// Reads a fresh listing so a stale snapshot cannot hide a variant.
    async fn equal_versions(&self, state: &TenantState, file_name: &str) -> Result<Vec<String>> {
        let (name, version) =
            parse_package_file_name(file_name).map_err(RepoError::InvalidPackage)?;
        let version = SemVer::parse(&version).map_err(RepoError::InvalidPackage)?;

        let snapshot = state.coordinator().refresh_objects().await?;
        Ok(snapshot
            .iter()
            .filter(|object| object.is_package() && object.file_name() != file_name)
            .filter(|object| match parse_package_file_name(object.file_name()) {
                Ok((stored_name, stored_version)) => {
                    stored_name == name
                        && SemVer::parse(&stored_version).map_or(false, |v| v == version)
                }
                Err(_) => false,
            })
            .map(|object| object.file_name().to_string())
            .collect())
    }

    /// Store a chart package and sync the tenant's index
    pub async fn upload_package(
        &self,
        tenant: &TenantKey,
        file_name: &str,
        content: impl Into<Bytes>,
    ) -> SyncResult {
        self.store_artifact(tenant, file_name, content.into(), ArtifactKind::Package)
            .await
    }

    /// Store a provenance file and sync the tenant's index
    pub async fn upload_provenance(
        &self,
        tenant: &TenantKey,
        file_name: &str,
        content: impl Into<Bytes>,
    ) -> SyncResult {
        self.store_artifact(tenant, file_name, content.into(), ArtifactKind::Provenance)
            .await
    }

    /// Delete a chart version (and its provenance file) and sync
    pub async fn delete_version(&self, tenant: &TenantKey, name: &str, version: &str) -> SyncResult {
        let file_name = format!("{}-{}{}", name, version, PACKAGE_SUFFIX);
        Self::validate_file_name(&file_name, ArtifactKind::Package)?;

        let state = self.registry.get_or_create(tenant)?;
        let path = join_path(tenant.storage_prefix(), &file_name);
        self.backend.delete(&path).await?;

        let provenance = format!("{}.prov", path);
        match self.backend.delete(&provenance).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                warn!(tenant = %tenant, path = %provenance, error = %e, "Failed to delete provenance file");
            }
        }
        info!(tenant = %tenant, name, version, "Chart version deleted");

        state.coordinator().sync_repository_index().await
    }

    /// Raw bytes of a stored artifact
    pub async fn fetch_object(&self, tenant: &TenantKey, file_name: &str) -> Result<Bytes> {
        if file_name.is_empty() || !sanitize_filename::is_sanitized(file_name) {
            return Err(RepoError::NotFound(file_name.to_string()));
        }
        self.registry.validate_key(tenant)?;
        let path = join_path(tenant.storage_prefix(), file_name);
        Ok(self.backend.get(&path).await?)
    }

    /// Published index without waiting; empty before the first sync
    pub fn published_index(&self, tenant: &TenantKey) -> Result<Arc<RepositoryIndex>> {
        Ok(self.registry.get(tenant)?.coordinator().published_index())
    }

    /// Index to serve; the first access of a known tenant waits for a sync
    ///
    /// Unknown tenants are `TenantNotFound`; reads never create them.
    pub async fn serve_index(&self, tenant: &TenantKey) -> Result<Arc<RepositoryIndex>> {
        let state = self.registry.get(tenant)?;
        self.current_index(&state).await
    }

    async fn current_index(&self, state: &TenantState) -> Result<Arc<RepositoryIndex>> {
        let coordinator = state.coordinator();
        if coordinator.has_published() {
            return Ok(coordinator.published_index());
        }
        coordinator.sync_repository_index().await
    }

    /// Every chart with its versions, highest version first
    pub async fn list_charts(
        &self,
        tenant: &TenantKey,
    ) -> Result<BTreeMap<String, Vec<ChartVersion>>> {
        Ok(self.serve_index(tenant).await?.entries.clone())
    }

    pub async fn chart_versions(&self, tenant: &TenantKey, name: &str) -> Result<Vec<ChartVersion>> {
        let index = self.serve_index(tenant).await?;
        index
            .versions(name)
            .map(<[ChartVersion]>::to_vec)
            .ok_or_else(|| RepoError::not_found(format!("chart '{}'", name)))
    }

    /// One version of a chart; `latest` selects the highest version
    pub async fn chart_version(
        &self,
        tenant: &TenantKey,
        name: &str,
        version: &str,
    ) -> Result<ChartVersion> {
        let index = self.serve_index(tenant).await?;
        index
            .get(name, version)
            .cloned()
            .ok_or_else(|| RepoError::not_found(format!("chart '{}' version '{}'", name, version)))
    }

    /// Force a sync of one tenant
    pub async fn refresh(&self, tenant: &TenantKey) -> SyncResult {
        let state = self.registry.get_or_create(tenant)?;
        state.coordinator().sync_repository_index().await
    }

    /// Sync every known tenant concurrently
    pub async fn refresh_all(&self) -> Vec<(TenantKey, SyncResult)> {
        let tenants = self.registry.tenants();
        let syncs = tenants.into_iter().filter_map(|key| {
            let state = self.registry.get(&key).ok()?;
            Some(async move {
                let result = state.coordinator().sync_repository_index().await;
                (key, result)
            })
        });
        futures::future::join_all(syncs).await
    }

    pub fn status(&self, tenant: &TenantKey) -> Result<SyncStatus> {
        Ok(self.registry.get(tenant)?.coordinator().status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{compute_digest, MemoryBackend};
    use rstest::rstest;

    fn repository(options: RepositoryOptions) -> (Arc<MemoryBackend>, ChartRepository) {
        let backend = Arc::new(MemoryBackend::new());
        let repo = ChartRepository::new(options, backend.clone());
        (backend, repo)
    }

    fn single_tenant() -> RepositoryOptions {
        RepositoryOptions {
            chart_url: "http://charts.example.com".to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("foo-1.0.0.tgz", ArtifactKind::Package, true)]
    #[case("my-chart-0.1.0-rc.1.tgz", ArtifactKind::Package, true)]
    #[case("foo-1.0.0.tgz.prov", ArtifactKind::Package, false)]
    #[case("foo-1.0.0.tgz.prov", ArtifactKind::Provenance, true)]
    #[case("foo-1.0.0.tgz", ArtifactKind::Provenance, false)]
    #[case("foo.tgz", ArtifactKind::Package, false)]
    #[case("../foo-1.0.0.tgz", ArtifactKind::Package, false)]
    #[case("org/foo-1.0.0.tgz", ArtifactKind::Package, false)]
    #[case(".foo-1.0.0.tgz", ArtifactKind::Package, false)]
    fn test_file_name_validation(
        #[case] file_name: &str,
        #[case] kind: ArtifactKind,
        #[case] valid: bool,
    ) {
        assert_eq!(
            ChartRepository::validate_file_name(file_name, kind).is_ok(),
            valid
        );
    }

    #[tokio::test]
    async fn test_upload_publishes_and_refuses_overwrite() {
        let (_, repo) = repository(single_tenant());
        let tenant = repo.default_tenant();

        let index = repo
            .upload_package(&tenant, "foo-1.0.0.tgz", b"chart".to_vec())
            .await
            .unwrap();
        let entry = index.get("foo", "1.0.0").unwrap();
        assert_eq!(entry.urls, vec!["http://charts.example.com/foo-1.0.0.tgz"]);

        let again = repo
            .upload_package(&tenant, "foo-1.0.0.tgz", b"chart".to_vec())
            .await;
        assert!(matches!(again, Err(RepoError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_overwrite_allowed() {
        let (_, repo) = repository(RepositoryOptions {
            allow_overwrite: true,
            ..single_tenant()
        });
        let tenant = repo.default_tenant();

        let first = repo
            .upload_package(&tenant, "foo-1.0.0.tgz", b"one".to_vec())
            .await
            .unwrap();
        let second = repo
            .upload_package(&tenant, "foo-1.0.0.tgz", b"two".to_vec())
            .await
            .unwrap();

        assert_ne!(
            first.get("foo", "1.0.0").unwrap().digest,
            second.get("foo", "1.0.0").unwrap().digest
        );
    }

    #[tokio::test]
    async fn test_delete_removes_provenance() {
        let (backend, repo) = repository(single_tenant());
        let tenant = repo.default_tenant();

        repo.upload_package(&tenant, "foo-1.0.0.tgz", b"chart".to_vec())
            .await
            .unwrap();
        repo.upload_provenance(&tenant, "foo-1.0.0.tgz.prov", b"sig".to_vec())
            .await
            .unwrap();
        assert_eq!(backend.len(), 2);

        let index = repo.delete_version(&tenant, "foo", "1.0.0").await.unwrap();
        assert!(index.is_empty());
        assert!(backend.is_empty());

        let missing = repo.delete_version(&tenant, "foo", "1.0.0").await;
        assert!(matches!(missing, Err(RepoError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reads_before_and_after_first_sync() {
        let (backend, repo) = repository(single_tenant());
        let tenant = repo.default_tenant();
        backend
            .put("bar-0.1.0.tgz", Bytes::from_static(b"bar"))
            .await
            .unwrap();

        assert!(repo.published_index(&tenant).unwrap().is_empty());

        let charts = repo.list_charts(&tenant).await.unwrap();
        assert_eq!(charts.len(), 1);
        assert_eq!(
            repo.chart_version(&tenant, "bar", "latest").await.unwrap().version,
            "0.1.0"
        );
        assert!(matches!(
            repo.chart_versions(&tenant, "missing").await,
            Err(RepoError::NotFound(_))
        ));
        assert_eq!(
            repo.fetch_object(&tenant, "bar-0.1.0.tgz").await.unwrap(),
            Bytes::from_static(b"bar")
        );
    }

    #[tokio::test]
    async fn test_multi_tenant_reads_require_known_tenant() {
        let (_, repo) = repository(RepositoryOptions {
            multi_tenancy: true,
            ..single_tenant()
        });
        let org = TenantKey::new("org1").unwrap();

        assert!(matches!(
            repo.published_index(&org),
            Err(RepoError::TenantNotFound(_))
        ));

        let index = repo
            .upload_package(&org, "foo-1.0.0.tgz", b"chart".to_vec())
            .await
            .unwrap();
        assert_eq!(
            index.get("foo", "1.0.0").unwrap().urls,
            vec!["http://charts.example.com/org1/foo-1.0.0.tgz"]
        );
        assert_eq!(repo.published_index(&org).unwrap().version_count(), 1);
        assert_eq!(repo.status(&org).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_reads_never_create_tenants() {
        let (backend, repo) = repository(RepositoryOptions {
            multi_tenancy: true,
            ..single_tenant()
        });
        backend
            .put("ghost/foo-1.0.0.tgz", Bytes::from_static(b"foo"))
            .await
            .unwrap();
        let ghost = TenantKey::new("ghost").unwrap();
        let nobody = TenantKey::new("nobody").unwrap();

        assert!(matches!(
            repo.serve_index(&nobody).await,
            Err(RepoError::TenantNotFound(_))
        ));
        assert!(matches!(
            repo.list_charts(&nobody).await,
            Err(RepoError::TenantNotFound(_))
        ));
        assert!(matches!(
            repo.chart_version(&nobody, "foo", "latest").await,
            Err(RepoError::TenantNotFound(_))
        ));
        assert!(matches!(
            repo.fetch_object(&nobody, "foo-1.0.0.tgz").await,
            Err(RepoError::NotFound(_))
        ));
        // 直接读取存储对象，但不登记租户
        assert_eq!(
            repo.fetch_object(&ghost, "foo-1.0.0.tgz").await.unwrap(),
            Bytes::from_static(b"foo")
        );
        assert!(matches!(
            repo.fetch_object(&TenantKey::implicit(), "foo-1.0.0.tgz").await,
            Err(RepoError::InvalidTenantKey(_))
        ));

        assert!(repo.registry().is_empty());
        assert_eq!(backend.list_calls(), 0);

        repo.refresh(&ghost).await.unwrap();
        assert_eq!(repo.registry().len(), 1);
        assert_eq!(repo.list_charts(&ghost).await.unwrap().len(), 1);
    }

    #[rstest]
    #[case("foo-v1.0.0.tgz")]
    #[case("foo-1.0.0+build.5.tgz")]
    #[tokio::test]
    async fn test_equal_precedence_upload_refused(#[case] variant: &str) {
        let (backend, repo) = repository(single_tenant());
        let tenant = repo.default_tenant();

        repo.upload_package(&tenant, "foo-1.0.0.tgz", b"one".to_vec())
            .await
            .unwrap();
        let again = repo.upload_package(&tenant, variant, b"two".to_vec()).await;

        assert!(matches!(again, Err(RepoError::AlreadyExists(_))));
        assert_eq!(backend.len(), 1);
        let index = repo.published_index(&tenant).unwrap();
        assert_eq!(index.get("foo", "1.0.0").unwrap().digest, compute_digest(b"one"));

        // 不同版本的同名 chart 不受影响
        let index = repo
            .upload_package(&tenant, "foo-1.0.1.tgz", b"three".to_vec())
            .await
            .unwrap();
        assert_eq!(index.version_count(), 2);
    }

    #[tokio::test]
    async fn test_equal_precedence_upload_replaces_when_overwrite_allowed() {
        let (backend, repo) = repository(RepositoryOptions {
            allow_overwrite: true,
            ..single_tenant()
        });
        let tenant = repo.default_tenant();

        repo.upload_package(&tenant, "foo-1.0.0.tgz", b"one".to_vec())
            .await
            .unwrap();
        repo.upload_provenance(&tenant, "foo-1.0.0.tgz.prov", b"sig".to_vec())
            .await
            .unwrap();
        let index = repo
            .upload_package(&tenant, "foo-v1.0.0.tgz", b"two".to_vec())
            .await
            .unwrap();

        assert_eq!(backend.len(), 1);
        assert!(backend.get("foo-1.0.0.tgz.prov").await.is_err());
        let versions = index.versions("foo").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "v1.0.0");
        assert_eq!(versions[0].digest, compute_digest(b"two"));
        assert_eq!(versions[0].urls, vec!["http://charts.example.com/foo-v1.0.0.tgz"]);
    }

    #[tokio::test]
    async fn test_refresh_all_covers_every_tenant() {
        let (backend, repo) = repository(RepositoryOptions {
            multi_tenancy: true,
            ..single_tenant()
        });
        for org in ["org1", "org2"] {
            repo.refresh(&TenantKey::new(org).unwrap()).await.unwrap();
        }
        backend.fail_prefix("org2", StorageError::Unavailable("down".to_string()));

        let results = repo.refresh_all().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(RepoError::StorageUnavailable(_))));
    }
}
