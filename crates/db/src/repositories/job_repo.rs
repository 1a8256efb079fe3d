//! Repository for the `jobs` table.
//!
//! Status checks happen in Rust through [`JobMutation::next_status`] while the
//! row is locked with `SELECT ... FOR UPDATE`, so concurrent writers to the
//! same job are serialized and writers to different jobs never contend.
//! Output is appended in SQL (`stdout || $n`); stored text is never rewritten.

use deployd_core::job::{is_valid_progress, Job, JobMutation, JobStatus, OutputStream};
use deployd_core::types::JobId;
use sqlx::PgPool;

use crate::models::job::JobRow;
use crate::store::StoreError;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, status, command, parameters, stdout, stderr, \
    progress, exit_code, created_at, updated_at";

/// Provides CRUD operations for deployment jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a freshly built `pending` job and return the stored row.
    ///
    /// Parameters are sent as text and cast to `json`: a bound JSON value
    /// travels as `jsonb`, which would reorder its keys.
    pub async fn insert(pool: &PgPool, job: &Job) -> Result<JobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (id, status, command, parameters, created_at, updated_at) \
             VALUES ($1, $2, $3, $4::json, $5, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job.id)
            .bind(job.status.as_str())
            .bind(&job.command)
            .bind(job.parameters.to_string())
            .bind(job.created_at)
            .fetch_one(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All jobs, newest first.
    pub async fn list_newest_first(pool: &PgPool) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC");
        sqlx::query_as::<_, JobRow>(&query).fetch_all(pool).await
    }

    /// Apply one mutation atomically. Returns the resulting status.
    pub async fn apply(
        pool: &PgPool,
        id: JobId,
        mutation: &JobMutation,
    ) -> Result<JobStatus, StoreError> {
        let mut tx = pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(StoreError::NotFound(id));
        };
        let current: JobStatus = current
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("job {id} has status '{current}'")))?;
        let next = mutation.next_status(current)?;

        match mutation {
            JobMutation::MarkRunning => {
                sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .bind(next.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            JobMutation::AppendOutput {
                stream,
                line,
                progress,
            } => {
                let column = match stream {
                    OutputStream::Stdout => "stdout",
                    OutputStream::Stderr => "stderr",
                };
                let query = format!(
                    "UPDATE jobs \
                     SET {column} = {column} || $2, \
                         progress = COALESCE($3, progress), \
                         updated_at = NOW() \
                     WHERE id = $1"
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(format!("{line}\n"))
                    .bind(progress.filter(|p| is_valid_progress(*p)))
                    .execute(&mut *tx)
                    .await?;
            }
            JobMutation::Finish { exit_code } => {
                sqlx::query(
                    "UPDATE jobs SET status = $2, exit_code = $3, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .bind(next.as_str())
                .bind(exit_code)
                .execute(&mut *tx)
                .await?;
            }
            JobMutation::Fail { exit_code, reason } => {
                sqlx::query(
                    "UPDATE jobs \
                     SET status = $2, exit_code = $3, stderr = stderr || $4, updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(next.as_str())
                .bind(exit_code)
                .bind(format!("{reason}\n"))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(next)
    }
}
