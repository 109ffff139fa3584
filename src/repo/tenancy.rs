//! Tenancy Registry
//!
//! Owns one [`TenantState`] per tenant key. With multi-tenancy disabled the
//! registry holds exactly one implicit tenant (the storage root), created
//! with the registry. With multi-tenancy enabled, tenants are created on
//! first trigger; the create-if-absent step only holds the map shard that
//! owns the key, so creating one tenant never waits on another tenant's sync.

use super::coordinator::{RegenerationCoordinator, SyncSettings};
use super::index::download_url;
use crate::error::{RepoError, Result};
use crate::storage::StorageBackend;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

static TENANT_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("tenant key pattern is valid"));

/// Identifies a tenant; doubles as its storage prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantKey(String);

impl TenantKey {
    /// Validated tenant key
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if !TENANT_KEY_PATTERN.is_match(&key) {
            return Err(RepoError::InvalidTenantKey(key));
        }
        Ok(Self(key))
    }

    /// The single tenant used when multi-tenancy is disabled
    pub fn implicit() -> Self {
        Self(String::new())
    }

    /// Derive the key from the first segment of a request path
    ///
    /// `/org1/index.yaml` and `org1/charts/foo-1.0.0.tgz` both yield `org1`.
    pub fn from_request_path(path: &str) -> Result<Self> {
        let segment = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        Self::new(segment)
    }

    pub fn is_implicit(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn storage_prefix(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_implicit() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Isolated state of one tenant: object cache, published index and sync
/// bookkeeping, all owned by its coordinator
#[derive(Debug)]
pub struct TenantState {
    key: TenantKey,
    coordinator: RegenerationCoordinator,
    created_at: DateTime<Utc>,
}

impl TenantState {
    pub fn key(&self) -> &TenantKey {
        &self.key
    }

    pub fn coordinator(&self) -> &RegenerationCoordinator {
        &self.coordinator
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Map of tenant key to tenant state
#[derive(Debug)]
pub struct TenancyRegistry {
    multi_tenancy: bool,
    chart_url: String,
    backend: Arc<dyn StorageBackend>,
    settings: SyncSettings,
    tenants: DashMap<TenantKey, Arc<TenantState>>,
}

impl TenancyRegistry {
    pub fn new(
        multi_tenancy: bool,
        chart_url: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        settings: SyncSettings,
    ) -> Self {
        let registry = Self {
            multi_tenancy,
            chart_url: chart_url.into(),
            backend,
            settings,
            tenants: DashMap::new(),
        };
        if !multi_tenancy {
            let key = TenantKey::implicit();
            let state = registry.create_state(&key);
            registry.tenants.insert(key, state);
        }
        registry
    }

    pub fn multi_tenancy(&self) -> bool {
        self.multi_tenancy
    }

    /// Key to use for requests when multi-tenancy is disabled
    pub fn default_key(&self) -> TenantKey {
        TenantKey::implicit()
    }

    /// Download root of a tenant
    pub fn tenant_base_url(&self, key: &TenantKey) -> String {
        if key.is_implicit() {
            self.chart_url.clone()
        } else if self.chart_url.is_empty() {
            key.as_str().to_string()
        } else {
            download_url(&self.chart_url, key.as_str())
        }
    }

    fn create_state(&self, key: &TenantKey) -> Arc<TenantState> {
        let coordinator = RegenerationCoordinator::new(
            key.storage_prefix(),
            self.tenant_base_url(key),
            Arc::clone(&self.backend),
            self.settings,
        );
        info!(tenant = %key, "Tenant state created");
        Arc::new(TenantState {
            key: key.clone(),
            coordinator,
            created_at: Utc::now(),
        })
    }

    /// Whether `key` can address a tenant in the current mode
    pub fn validate_key(&self, key: &TenantKey) -> Result<()> {
        match (self.multi_tenancy, key.is_implicit()) {
            (true, true) => Err(RepoError::InvalidTenantKey(
                "a tenant key is required when multi-tenancy is enabled".to_string(),
            )),
            (false, false) => Err(RepoError::TenantNotFound(key.to_string())),
            _ => Ok(()),
        }
    }

    /// Existing state, or freshly created state under multi-tenancy
    ///
    /// Concurrent first accesses for the same key observe the same state.
    pub fn get_or_create(&self, key: &TenantKey) -> Result<Arc<TenantState>> {
        self.validate_key(key)?;
        if let Some(state) = self.tenants.get(key) {
            return Ok(Arc::clone(state.value()));
        }
        if !self.multi_tenancy {
            return Err(RepoError::TenantNotFound(key.to_string()));
        }
        let state = self
            .tenants
            .entry(key.clone())
            .or_insert_with(|| self.create_state(key));
        Ok(Arc::clone(state.value()))
    }

    /// Existing state only; reads never create tenants
    pub fn get(&self, key: &TenantKey) -> Result<Arc<TenantState>> {
        self.validate_key(key)?;
        self.tenants
            .get(key)
            .map(|state| Arc::clone(state.value()))
            .ok_or_else(|| RepoError::TenantNotFound(key.to_string()))
    }

    /// Drop a tenant; an attempt already in flight completes harmlessly
    pub fn remove(&self, key: &TenantKey) -> Option<Arc<TenantState>> {
        let removed = self.tenants.remove(key).map(|(_, state)| state);
        if removed.is_some() {
            info!(tenant = %key, "Tenant state removed");
        }
        removed
    }

    pub fn tenants(&self) -> Vec<TenantKey> {
        let mut keys: Vec<TenantKey> = self.tenants.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
