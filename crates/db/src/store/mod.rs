//! The [`JobStore`] trait and its implementations.

mod cache;
mod memory;
mod postgres;

use async_trait::async_trait;
use deployd_core::error::CoreError;
use deployd_core::job::{Job, JobMutation, JobStatus, INTERNAL_ERROR_EXIT_CODE};
use deployd_core::types::JobId;

pub use cache::CachedJobStore;
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// SQLSTATE codes after which the same transaction may succeed on retry.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Errors surfaced by job stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// The mutation would break a lifecycle invariant.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backend is temporarily unable to serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only connection and pool failures, serialization failures and
    /// deadlocks qualify. Anything the database rejected outright (bad data,
    /// a violated constraint) fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
                ),
                _ => false,
            },
            Self::NotFound(_) | Self::Conflict(_) | Self::Corrupt(_) => false,
        }
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { id, .. } => Self::NotFound(id),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            CoreError::Validation(msg) | CoreError::Internal(msg) => Self::Corrupt(msg),
        }
    }
}

/// Authoritative storage of job records.
///
/// Implementations must serialize [`apply_update`](JobStore::apply_update)
/// calls for the same job while letting different jobs proceed in parallel,
/// and must reject mutations that break the job lifecycle invariants.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job. The returned record is immediately
    /// visible to [`get`](JobStore::get) and [`list`](JobStore::list).
    async fn create(&self, parameters: serde_json::Value, command: String)
        -> Result<Job, StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Atomically apply one mutation and return the job's new status.
    async fn apply_update(&self, id: JobId, mutation: &JobMutation)
        -> Result<JobStatus, StoreError>;

    /// All jobs, newest first by `created_at`.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Fail every job that is not terminal, with the sentinel exit code and
    /// `reason` on stderr. Returns how many jobs were failed.
    ///
    /// Only valid while nothing is executing jobs against this store, i.e.
    /// at startup, when unfinished records belong to a previous process.
    async fn fail_unfinished(&self, reason: &str) -> Result<usize, StoreError> {
        let mut failed = 0;
        for job in self.list().await? {
            if job.status.is_terminal() {
                continue;
            }
            if job.status == JobStatus::Pending {
                self.apply_update(job.id, &JobMutation::MarkRunning).await?;
            }
            let fail = JobMutation::Fail {
                exit_code: INTERNAL_ERROR_EXIT_CODE,
                reason: reason.to_string(),
            };
            self.apply_update(job.id, &fail).await?;
            failed += 1;
        }
        Ok(failed)
    }
}
