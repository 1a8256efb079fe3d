//! In-process job store.
//!
//! Each record sits behind its own mutex, and the map of records behind a
//! read-write lock that is only held long enough to find or insert an entry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deployd_core::job::{Job, JobMutation, JobStatus};
use deployd_core::types::JobId;
use tokio::sync::{Mutex, RwLock};

use super::{JobStore, StoreError};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: JobId) -> Result<Arc<Mutex<Job>>, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        parameters: serde_json::Value,
        command: String,
    ) -> Result<Job, StoreError> {
        let job = Job::new(parameters, command);
        self.jobs
            .write()
            .await
            .insert(job.id, Arc::new(Mutex::new(job.clone())));
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let entry = self.entry(id).await?;
        let job = entry.lock().await.clone();
        Ok(job)
    }

    async fn apply_update(
        &self,
        id: JobId,
        mutation: &JobMutation,
    ) -> Result<JobStatus, StoreError> {
        let entry = self.entry(id).await?;
        let mut job = entry.lock().await;
        job.apply(mutation)?;
        Ok(job.status)
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let entries: Vec<_> = self.jobs.read().await.values().cloned().collect();

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(entry.lock().await.clone());
        }
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(jobs)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use deployd_core::job::{OutputStream, INTERNAL_ERROR_EXIT_CODE};
    use serde_json::json;

    use super::*;

    fn append(line: &str) -> JobMutation {
        JobMutation::AppendOutput {
            stream: OutputStream::Stdout,
            line: line.to_string(),
            progress: None,
        }
    }

    #[tokio::test]
    async fn created_job_is_immediately_visible() {
        let store = MemoryJobStore::new();
        let job = store
            .create(json!({"cluster-name": "c1"}), "nkp create cluster".into())
            .await
            .unwrap();

        let fetched = store.get(job.id).await.unwrap();
        assert_eq!(fetched, job);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        let id = deployd_core::types::new_job_id();
        assert_matches!(store.get(id).await, Err(StoreError::NotFound(found)) if found == id);
        assert_matches!(
            store.apply_update(id, &JobMutation::MarkRunning).await,
            Err(StoreError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn invariant_violations_are_conflicts() {
        let store = MemoryJobStore::new();
        let job = store.create(json!({}), "nkp".into()).await.unwrap();

        assert_matches!(
            store.apply_update(job.id, &append("early")).await,
            Err(StoreError::Conflict(_))
        );
        assert_matches!(
            store.apply_update(job.id, &JobMutation::Finish { exit_code: 0 }).await,
            Err(StoreError::Conflict(_))
        );
        assert_eq!(store.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = MemoryJobStore::new();
        let first = store.create(json!({}), "a".into()).await.unwrap();
        let second = store.create(json!({}), "b".into()).await.unwrap();
        let third = store.create(json!({}), "c".into()).await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_to_one_job_are_not_lost() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create(json!({}), "nkp".into()).await.unwrap();
        store.apply_update(job.id, &JobMutation::MarkRunning).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.apply_update(job.id, &append(&format!("line-{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get(job.id).await.unwrap();
        let lines: HashSet<&str> = stored.stdout.lines().collect();
        assert_eq!(lines.len(), 50);
        assert!((0..50).all(|i| lines.contains(format!("line-{i}").as_str())));
    }

    #[tokio::test]
    async fn updates_to_one_job_leave_others_untouched() {
        let store = MemoryJobStore::new();
        let a = store.create(json!({}), "a".into()).await.unwrap();
        let b = store.create(json!({}), "b".into()).await.unwrap();

        store.apply_update(a.id, &JobMutation::MarkRunning).await.unwrap();
        store.apply_update(a.id, &append("hello")).await.unwrap();
        store
            .apply_update(a.id, &JobMutation::Finish { exit_code: 0 })
            .await
            .unwrap();

        assert_eq!(store.get(b.id).await.unwrap(), b);
        assert_eq!(store.get(a.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unfinished_jobs_are_failed_with_the_sentinel() {
        let store = MemoryJobStore::new();
        let pending = store.create(json!({}), "a".into()).await.unwrap();
        let running = store.create(json!({}), "b".into()).await.unwrap();
        let done = store.create(json!({}), "c".into()).await.unwrap();
        store.apply_update(running.id, &JobMutation::MarkRunning).await.unwrap();
        store.apply_update(running.id, &append("halfway")).await.unwrap();
        store.apply_update(done.id, &JobMutation::MarkRunning).await.unwrap();
        store
            .apply_update(done.id, &JobMutation::Finish { exit_code: 0 })
            .await
            .unwrap();

        let failed = store.fail_unfinished("Job interrupted by restart").await.unwrap();
        assert_eq!(failed, 2);

        for id in [pending.id, running.id] {
            let job = store.get(id).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.exit_code, Some(INTERNAL_ERROR_EXIT_CODE));
            assert!(job.stderr.ends_with("Job interrupted by restart\n"));
        }
        assert_eq!(store.get(running.id).await.unwrap().stdout, "halfway\n");
        assert_eq!(store.get(done.id).await.unwrap().exit_code, Some(0));
        assert_eq!(store.fail_unfinished("again").await.unwrap(), 0);
    }
}
