//! Regeneration Coordinator
//!
//! Drives one tenant from Idle to SyncInFlight and back:
//!
//! ```text
//!   trigger ──► Idle ──(leader)──► refresh objects ──► build index
//!                 ▲                                         │
//!                 └── clear marker ◄── fan out ◄── publish ◄┘
//! ```
//!
//! Triggers arriving while a sync is in flight join it and receive the
//! leader's result. Publication is a single pointer swap performed after the
//! new index is complete, so readers observe either the previous index or the
//! new one. A failed attempt publishes nothing: the previous index stays
//! authoritative and the error goes to that attempt's waiters only.

use super::flight::{FlightRole, SingleFlight};
use super::index::{build_index_with_report, RepositoryIndex};
use super::object_cache::{ObjectCache, ObjectSnapshot};
use crate::error::{RepoError, Result};
use crate::storage::StorageBackend;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one coordinated sync attempt, shared by all its waiters
pub type SyncResult = Result<Arc<RepositoryIndex>>;

/// Timeouts bounding a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Bound on a single backend listing
    pub listing_timeout: Duration,
    /// Bound on a whole attempt (listing + build + publish)
    pub sync_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            listing_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable sync history of a tenant
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub attempts: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_flight: bool,
    pub published_versions: usize,
}

#[derive(Debug)]
struct CoordinatorInner {
    label: String,
    base_url: String,
    backend: Arc<dyn StorageBackend>,
    settings: SyncSettings,
    objects: Arc<ObjectCache>,
    published: ArcSwap<RepositoryIndex>,
    has_published: AtomicBool,
    regeneration: SingleFlight<SyncResult>,
    attempts: AtomicU64,
    failures: AtomicU64,
    last_outcome: Mutex<(Option<DateTime<Utc>>, Option<String>)>,
}

/// Per-tenant sync coordinator
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct RegenerationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RegenerationCoordinator {
    /// `prefix` is the tenant's storage prefix, `base_url` its download root
    pub fn new(
        prefix: impl Into<String>,
        base_url: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        settings: SyncSettings,
    ) -> Self {
        let prefix = prefix.into();
        let label = if prefix.is_empty() {
            "<root>".to_string()
        } else {
            prefix.clone()
        };
        Self {
            inner: Arc::new(CoordinatorInner {
                label,
                base_url: base_url.into(),
                backend,
                settings,
                objects: Arc::new(ObjectCache::new(prefix, settings.listing_timeout)),
                published: ArcSwap::from_pointee(RepositoryIndex::empty()),
                has_published: AtomicBool::new(false),
                regeneration: SingleFlight::new(),
                attempts: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                last_outcome: Mutex::new((None, None)),
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    /// Last successfully published index; never blocks
    pub fn published_index(&self) -> Arc<RepositoryIndex> {
        self.inner.published.load_full()
    }

    /// Whether any sync has succeeded yet
    pub fn has_published(&self) -> bool {
        self.inner.has_published.load(Ordering::Acquire)
    }

    pub fn object_snapshot(&self) -> Arc<ObjectSnapshot> {
        self.inner.objects.snapshot()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.regeneration.is_in_flight()
    }

    pub fn status(&self) -> SyncStatus {
        let (last_success, last_error) = self.inner.last_outcome.lock().clone();
        SyncStatus {
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            last_success,
            last_error,
            in_flight: self.is_syncing(),
            published_versions: self.published_index().version_count(),
        }
    }

    /// Refresh the object cache alone (coalesced with concurrent refreshes)
    pub async fn refresh_objects(&self) -> Result<Arc<ObjectSnapshot>> {
        self.inner
            .objects
            .refresh(Arc::clone(&self.inner.backend))
            .await
    }

    /// Refresh, rebuild and publish, joining an in-flight attempt if any
    pub async fn sync_repository_index(&self) -> SyncResult {
        let (role, flight) = self.start_or_join();
        debug!(tenant = %self.inner.label, role = ?role, "Waiting for index sync");
        flight.await
    }

    /// Like [`Self::sync_repository_index`] but stop waiting after `deadline`
    ///
    /// Abandoning only affects this caller; the attempt keeps running and
    /// still publishes for everyone else.
    pub async fn sync_repository_index_within(&self, deadline: Duration) -> SyncResult {
        let (_, flight) = self.start_or_join();
        match tokio::time::timeout(deadline, flight).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    tenant = %self.inner.label,
                    deadline = ?deadline,
                    "Caller stopped waiting for index sync"
                );
                Err(RepoError::Timeout(format!(
                    "index sync for '{}' did not finish within {:?}",
                    self.inner.label, deadline
                )))
            }
        }
    }

    fn start_or_join(
        &self,
    ) -> (
        FlightRole,
        impl std::future::Future<Output = SyncResult> + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        let flight = self.inner.regeneration.join(move || async move {
            let attempt = Uuid::new_v4();
            regenerate(inner, attempt).await
        });
        let role = flight.role();
        let label = self.inner.label.clone();
        let waiting = async move {
            flight.wait().await.map_err(|e| {
                RepoError::internal(format!("index sync for '{}': {}", label, e))
            })?
        };
        (role, waiting)
    }
}

/// Leader body of one attempt
async fn regenerate(inner: Arc<CoordinatorInner>, attempt: Uuid) -> SyncResult {
    let started = Instant::now();
    inner.attempts.fetch_add(1, Ordering::Relaxed);
    info!(tenant = %inner.label, attempt = %attempt, "Index sync started");

    let work = async {
        let snapshot = inner
            .objects
            .refresh(Arc::clone(&inner.backend))
            .await?;
        let (index, report) = build_index_with_report(&snapshot, &inner.base_url)?;
        Ok::<_, RepoError>((index, report))
    };

    let outcome = match tokio::time::timeout(inner.settings.sync_timeout, work).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RepoError::Timeout(format!(
            "index sync for '{}' exceeded {:?}",
            inner.label, inner.settings.sync_timeout
        ))),
    };

    match outcome {
        Ok((index, report)) => {
            let index = Arc::new(index);
            inner.published.store(Arc::clone(&index));
            inner.has_published.store(true, Ordering::Release);
            inner.last_outcome.lock().0 = Some(index.generated);

            info!(
                tenant = %inner.label,
                attempt = %attempt,
                charts = index.chart_count(),
                versions = report.indexed,
                skipped = report.skipped.len(),
                elapsed = ?started.elapsed(),
                "Index sync published"
            );
            Ok(index)
        }
        Err(e) => {
            inner.failures.fetch_add(1, Ordering::Relaxed);
            inner.last_outcome.lock().1 = Some(e.to_string());

            if e.is_transient() {
                warn!(
                    tenant = %inner.label,
                    attempt = %attempt,
                    error = %e,
                    "Index sync failed, previous index still served"
                );
            } else {
                error!(
                    tenant = %inner.label,
                    attempt = %attempt,
                    error = %e,
                    "Index sync failed, previous index still served"
                );
            }
            Err(e)
        }
    }
}
