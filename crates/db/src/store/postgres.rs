//! PostgreSQL-backed job store.

use async_trait::async_trait;
use deployd_core::job::{Job, JobMutation, JobStatus};
use deployd_core::types::JobId;
use sqlx::PgPool;

use super::{JobStore, StoreError};
use crate::repositories::JobRepo;

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(
        &self,
        parameters: serde_json::Value,
        command: String,
    ) -> Result<Job, StoreError> {
        let job = Job::new(parameters, command);
        JobRepo::insert(&self.pool, &job).await?.try_into()
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        JobRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound(id))?
            .try_into()
    }

    async fn apply_update(
        &self,
        id: JobId,
        mutation: &JobMutation,
    ) -> Result<JobStatus, StoreError> {
        JobRepo::apply(&self.pool, id, mutation).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        JobRepo::list_newest_first(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        crate::health_check(&self.pool).await?;
        Ok(())
    }
}
