//! In-memory storage backend
//!
//! Keeps every object in a sorted map. Besides serving ephemeral
//! repositories it is instrumented for exercising the coordinator: it counts
//! listing calls per prefix and can delay or fail listings on demand.

use super::{
    compute_digest, split_path, StorageBackend, StorageError, StorageObject, StorageResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredObject {
    content: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
}

/// Map-backed object store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    list_calls: AtomicUsize,
    list_calls_by_prefix: Mutex<HashMap<String, usize>>,
    list_delay: Mutex<Option<Duration>>,
    /// Failures consumed one per listing, in order
    queued_failures: Mutex<VecDeque<StorageError>>,
    /// Failures returned for every listing of a prefix until cleared
    prefix_failures: Mutex<HashMap<String, StorageError>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit modification time
    pub fn insert_with_time(&self, path: &str, content: impl Into<Bytes>, at: DateTime<Utc>) {
        let content = content.into();
        let etag = compute_digest(&content);
        self.objects.write().insert(
            path.trim_matches('/').to_string(),
            StoredObject {
                content,
                last_modified: at,
                etag,
            },
        );
    }

    /// Total number of `list` calls served (including failed ones)
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls_for(&self, prefix: &str) -> usize {
        self.list_calls_by_prefix
            .lock()
            .get(prefix.trim_matches('/'))
            .copied()
            .unwrap_or(0)
    }

    /// Make every listing sleep for `delay` before answering
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        *self.list_delay.lock() = delay;
    }

    /// Fail the next listing (any prefix) with `error`
    pub fn fail_next_list(&self, error: StorageError) {
        self.queued_failures.lock().push_back(error);
    }

    /// Fail every listing of `prefix` until [`MemoryBackend::clear_failures`]
    pub fn fail_prefix(&self, prefix: &str, error: StorageError) {
        self.prefix_failures
            .lock()
            .insert(prefix.trim_matches('/').to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.queued_failures.lock().clear();
        self.prefix_failures.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        let prefix = prefix.trim_matches('/').to_string();
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .list_calls_by_prefix
            .lock()
            .entry(prefix.clone())
            .or_insert(0) += 1;

        let delay = *self.list_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.queued_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.prefix_failures.lock().get(&prefix) {
            return Err(error.clone());
        }

        let objects = self.objects.read();
        let listing: Vec<StorageObject> = objects
            .iter()
            .filter_map(|(path, stored)| {
                let (parent, name) = split_path(path);
                (parent == prefix).then(|| StorageObject {
                    path: name.to_string(),
                    size: stored.content.len() as u64,
                    last_modified: stored.last_modified,
                    etag: stored.etag.clone(),
                })
            })
            .collect();

        debug!(prefix = %prefix, objects = listing.len(), "Listed memory backend");
        Ok(listing)
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        self.objects
            .read()
            .get(path.trim_matches('/'))
            .map(|stored| stored.content.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, content: Bytes) -> StorageResult<()> {
        self.insert_with_time(path, content, Utc::now());
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.objects
            .write()
            .remove(path.trim_matches('/'))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}
