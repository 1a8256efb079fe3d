//! Read-through cache for finished jobs.
//!
//! Only terminal snapshots are cached: a `completed` or `failed` record can
//! never change again, so a cached copy is never stale. Running jobs always
//! go to the inner store.

use std::sync::Mutex;

use async_trait::async_trait;
use deployd_core::job::{Job, JobMutation, JobStatus};
use deployd_core::types::JobId;
use indexmap::IndexMap;

use super::{JobStore, StoreError};

pub struct CachedJobStore<S> {
    inner: S,
    capacity: usize,
    finished: Mutex<IndexMap<JobId, Job>>,
}

impl<S: JobStore> CachedJobStore<S> {
    /// Wrap `inner`, keeping at most `capacity` finished jobs. Oldest entries
    /// are evicted first.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            finished: Mutex::new(IndexMap::with_capacity(capacity)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of cached snapshots.
    pub fn cached_len(&self) -> usize {
        self.finished.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn lookup(&self, id: JobId) -> Option<Job> {
        self.finished.lock().ok()?.get(&id).cloned()
    }

    fn remember(&self, job: &Job) {
        if self.capacity == 0 || !job.status.is_terminal() {
            return;
        }
        // A poisoned lock only costs a cache miss.
        let Ok(mut finished) = self.finished.lock() else {
            return;
        };
        if finished.contains_key(&job.id) {
            return;
        }
        while finished.len() >= self.capacity {
            finished.shift_remove_index(0);
        }
        finished.insert(job.id, job.clone());
    }
}

#[async_trait]
impl<S: JobStore> JobStore for CachedJobStore<S> {
    async fn create(
        &self,
        parameters: serde_json::Value,
        command: String,
    ) -> Result<Job, StoreError> {
        self.inner.create(parameters, command).await
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        if let Some(job) = self.lookup(id) {
            return Ok(job);
        }
        let job = self.inner.get(id).await?;
        self.remember(&job);
        Ok(job)
    }

    async fn apply_update(
        &self,
        id: JobId,
        mutation: &JobMutation,
    ) -> Result<JobStatus, StoreError> {
        self.inner.apply_update(id, mutation).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.inner.list().await?;
        for job in jobs.iter().filter(|j| j.status.is_terminal()) {
            self.remember(job);
        }
        Ok(jobs)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
