//! Named-Container Pool (C4)
//!
//! A process-wide, in-memory, thread-safe registry of long-lived named
//! containers, keyed by name (case-insensitive, normalized to lowercase).
//! Each name gets its own 1-permit semaphore, so at most one job at a time
//! can operate on a given named container while unrelated names proceed in
//! parallel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("acquire cancelled")]
    Cancelled,
}

/// A pool record for a long-lived container.
#[derive(Debug, Clone)]
pub struct NamedContainerEntry {
    pub name: String,
    pub container_id: String,
    pub clone_path: String,
    pub owner: String,
    pub repo: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub in_use: bool,
}

impl NamedContainerEntry {
    pub fn new(
        name: impl Into<String>,
        container_id: impl Into<String>,
        clone_path: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            container_id: container_id.into(),
            clone_path: clone_path.into(),
            owner: owner.into(),
            repo: repo.into(),
            created_at: now,
            last_used_at: now,
            in_use: false,
        }
    }
}

/// Releases the per-name lock and clears `in_use` on drop. Owns an `Arc`
/// rather than borrowing the pool so it can be carried into a spawned
/// worker task for the lifetime of the job.
pub struct PoolGuard {
    pool: Arc<NamedContainerPool>,
    name: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.pool.entries.get_mut(&self.name) {
            entry.in_use = false;
        }
    }
}

/// In-memory registry of named containers with per-name mutual exclusion.
#[derive(Default)]
pub struct NamedContainerPool {
    entries: DashMap<String, NamedContainerEntry>,
    locks: DashMap<String, Arc<Semaphore>>,
}

impl NamedContainerPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(name: &str) -> String {
        name.to_lowercase()
    }

    /// Insert or replace an entry. Used for startup discovery and the first
    /// successful creation of a new named container.
    pub fn register(&self, entry: NamedContainerEntry) {
        let key = Self::normalize(&entry.name);
        self.entries.insert(key, entry);
    }

    /// Pure read; does not affect the exclusion lock.
    pub fn try_get(&self, name: &str) -> Option<NamedContainerEntry> {
        self.entries.get(&Self::normalize(name)).map(|e| e.clone())
    }

    /// Acquire exclusive access to `name`. If no lock slot exists yet it is
    /// created eagerly, so two workers racing to create the same brand-new
    /// container cannot both proceed.
    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<PoolGuard, PoolError> {
        let key = Self::normalize(name);
        let semaphore = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.map_err(|_| PoolError::Cancelled)?,
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
        };

        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.in_use = true;
            entry.last_used_at = Utc::now();
        }

        Ok(PoolGuard {
            pool: Arc::clone(self),
            name: key,
            _permit: permit,
        })
    }

    /// Drop the entry. Does not interfere with any in-flight handle.
    pub fn remove(&self, name: &str) {
        self.entries.remove(&Self::normalize(name));
    }

    /// Snapshot of all registered entries.
    pub fn get_all(&self) -> Vec<NamedContainerEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_without_prior_registration_succeeds() {
        let pool = Arc::new(NamedContainerPool::new());
        let cancel = CancellationToken::new();
        let guard = pool.acquire("svc-dev", &cancel).await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let pool = NamedContainerPool::new();
        let entry = NamedContainerEntry::new("svc-dev", "c1", "/tmp/x", "acme", "svc");
        pool.register(entry.clone());
        let fetched = pool.try_get("SVC-DEV").unwrap();
        assert_eq!(fetched.container_id, "c1");
    }

    #[tokio::test]
    async fn remove_then_get_is_none() {
        let pool = NamedContainerPool::new();
        pool.register(NamedContainerEntry::new("svc-dev", "c1", "/tmp/x", "acme", "svc"));
        pool.remove("svc-dev");
        assert!(pool.try_get("svc-dev").is_none());
    }

    #[tokio::test]
    async fn acquire_excludes_second_caller_until_released() {
        let pool = Arc::new(NamedContainerPool::new());
        let cancel = CancellationToken::new();
        let guard = pool.acquire("svc-dev", &cancel).await.unwrap();

        let pool2 = pool.clone();
        let handle = tokio::spawn(async move {
            let cancel2 = CancellationToken::new();
            pool2.acquire("svc-dev", &cancel2).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
    }
}
