//! Per-tenant object cache
//!
//! Holds the latest successful listing of a tenant's storage prefix as an
//! immutable [`ObjectSnapshot`]. A refresh replaces the snapshot wholesale;
//! nothing from an older listing survives a newer one, and a failed refresh
//! leaves the current snapshot untouched.
//!
//! Concurrent refreshes for the same tenant are coalesced: one listing is
//! issued and every caller receives the same snapshot (or error).

use super::flight::SingleFlight;
use crate::error::{RepoError, Result};
use crate::storage::{StorageBackend, StorageError, StorageObject};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Immutable view of one listing, keyed by relative path
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectSnapshot {
    objects: BTreeMap<String, StorageObject>,
    synced_at: Option<DateTime<Utc>>,
}

impl ObjectSnapshot {
    /// Snapshot of a tenant that has never been listed
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a raw listing
    ///
    /// A listing that reports an empty path or the same path twice is
    /// malformed and rejected as a whole.
    pub fn from_listing(
        listing: Vec<StorageObject>,
        synced_at: DateTime<Utc>,
    ) -> std::result::Result<Self, StorageError> {
        let mut objects = BTreeMap::new();
        for object in listing {
            if object.path.trim().is_empty() {
                return Err(StorageError::Malformed("object with empty path".to_string()));
            }
            if let Some(previous) = objects.insert(object.path.clone(), object) {
                return Err(StorageError::Malformed(format!(
                    "duplicate object path: {}",
                    previous.path
                )));
            }
        }
        Ok(Self {
            objects,
            synced_at: Some(synced_at),
        })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&StorageObject> {
        self.objects.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    /// Objects in path order
    pub fn iter(&self) -> impl Iterator<Item = &StorageObject> {
        self.objects.values()
    }

    /// When the listing behind this snapshot completed
    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }
}

pub type RefreshResult = Result<Arc<ObjectSnapshot>>;

/// Object cache of one tenant
#[derive(Debug)]
pub struct ObjectCache {
    prefix: String,
    snapshot: RwLock<Arc<ObjectSnapshot>>,
    flight: SingleFlight<RefreshResult>,
    listing_timeout: Duration,
}

impl ObjectCache {
    pub fn new(prefix: impl Into<String>, listing_timeout: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            snapshot: RwLock::new(Arc::new(ObjectSnapshot::empty())),
            flight: SingleFlight::new(),
            listing_timeout,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current snapshot (the last successful listing)
    pub fn snapshot(&self) -> Arc<ObjectSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn is_refreshing(&self) -> bool {
        self.flight.is_in_flight()
    }

    /// Refresh from the backend, joining an in-flight listing if any
    pub async fn refresh(
        self: &Arc<Self>,
        backend: Arc<dyn StorageBackend>,
    ) -> RefreshResult {
        let cache = Arc::clone(self);
        let flight = self
            .flight
            .join(move || async move { cache.list_and_replace(backend).await });

        debug!(
            prefix = %self.prefix,
            role = ?flight.role(),
            "Joined object refresh"
        );

        flight.wait().await.map_err(|e| {
            RepoError::internal(format!("object refresh for '{}': {}", self.prefix, e))
        })?
    }

    /// Leader body: one listing, then a wholesale swap on success
    async fn list_and_replace(&self, backend: Arc<dyn StorageBackend>) -> RefreshResult {
        let started = Instant::now();
        let listing = tokio::time::timeout(self.listing_timeout, backend.list(&self.prefix))
            .await
            .map_err(|_| {
                RepoError::StorageUnavailable(format!(
                    "listing '{}' timed out after {:?}",
                    self.prefix, self.listing_timeout
                ))
            })
            .and_then(|listing| listing.map_err(RepoError::from))
            .and_then(|listing| {
                ObjectSnapshot::from_listing(listing, Utc::now()).map_err(RepoError::from)
            });

        match listing {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.snapshot.write() = Arc::clone(&snapshot);
                info!(
                    prefix = %self.prefix,
                    objects = snapshot.len(),
                    elapsed = ?started.elapsed(),
                    "Object cache refreshed"
                );
                Ok(snapshot)
            }
            Err(e) => {
                warn!(
                    prefix = %self.prefix,
                    error = %e,
                    "Object listing failed, keeping previous snapshot"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{compute_digest, MemoryBackend};
    use bytes::Bytes;

    fn object(path: &str) -> StorageObject {
        StorageObject {
            path: path.to_string(),
            size: 3,
            last_modified: Utc::now(),
            etag: compute_digest(path.as_bytes()),
        }
    }

    #[test]
    fn test_snapshot_rejects_duplicates() {
        let result =
            ObjectSnapshot::from_listing(vec![object("a.tgz"), object("a.tgz")], Utc::now());
        assert!(matches!(result, Err(StorageError::Malformed(_))));
    }

    #[test]
    fn test_snapshot_rejects_empty_path() {
        let result = ObjectSnapshot::from_listing(vec![object(" ")], Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_orders_by_path() {
        let snapshot =
            ObjectSnapshot::from_listing(vec![object("b.tgz"), object("a.tgz")], Utc::now())
                .unwrap();
        let paths: Vec<&str> = snapshot.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["a.tgz", "b.tgz"]);
        assert!(snapshot.synced_at().is_some());
        assert!(ObjectSnapshot::empty().synced_at().is_none());
    }

    #[tokio::test]
    async fn test_refresh_replaces_wholesale() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"1")).await.unwrap();
        backend.put("bar-1.0.0.tgz", Bytes::from_static(b"2")).await.unwrap();

        let cache = Arc::new(ObjectCache::new("", Duration::from_secs(5)));
        let first = cache.refresh(backend.clone()).await.unwrap();
        assert_eq!(first.len(), 2);

        backend.delete("bar-1.0.0.tgz").await.unwrap();
        let second = cache.refresh(backend.clone()).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(!cache.snapshot().contains("bar-1.0.0.tgz"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"1")).await.unwrap();

        let cache = Arc::new(ObjectCache::new("", Duration::from_secs(5)));
        let before = cache.refresh(backend.clone()).await.unwrap();

        backend.fail_next_list(StorageError::Unavailable("down".to_string()));
        let result = cache.refresh(backend.clone()).await;

        assert!(matches!(result, Err(RepoError::StorageUnavailable(_))));
        assert_eq!(cache.snapshot(), before);
    }

    #[tokio::test]
    async fn test_listing_timeout() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_list_delay(Some(Duration::from_millis(200)));

        let cache = Arc::new(ObjectCache::new("", Duration::from_millis(20)));
        let result = cache.refresh(backend).await;

        assert!(matches!(result, Err(RepoError::StorageUnavailable(_))));
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_issue_one_listing() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("foo-1.0.0.tgz", Bytes::from_static(b"1")).await.unwrap();
        backend.set_list_delay(Some(Duration::from_millis(50)));

        let cache = Arc::new(ObjectCache::new("", Duration::from_secs(5)));
        let results = futures::future::join_all(
            (0..10).map(|_| cache.refresh(backend.clone() as Arc<dyn StorageBackend>)),
        )
        .await;

        assert_eq!(backend.list_calls(), 1);
        let first = results[0].as_ref().unwrap();
        assert!(results
            .iter()
            .all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
    }
}
