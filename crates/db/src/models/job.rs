//! Row model for the `jobs` table.

use deployd_core::job::{Job, JobStatus};
use deployd_core::types::{JobId, Timestamp};
use sqlx::FromRow;

use crate::store::StoreError;

/// A row from the `jobs` table, before the status text is parsed.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: JobId,
    pub status: String,
    pub command: String,
    pub parameters: serde_json::Value,
    pub stdout: String,
    pub stderr: String,
    pub progress: i16,
    pub exit_code: Option<i32>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("job {} has status '{}'", row.id, row.status)))?;

        Ok(Job {
            id: row.id,
            status,
            command: row.command,
            parameters: row.parameters,
            stdout: row.stdout,
            stderr: row.stderr,
            progress: row.progress,
            exit_code: row.exit_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
