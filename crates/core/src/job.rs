//! Job entity, status state machine, and the mutations that drive it.
//!
//! Every store implementation funnels writes through [`JobMutation::next_status`]
//! (and, for in-memory records, [`Job::apply`]) so the lifecycle invariants
//! hold regardless of the persistence backend:
//!
//! - status only moves `pending -> running -> completed | failed`;
//! - `exit_code` is present exactly when the status is terminal;
//! - `stdout` / `stderr` only grow, and only while the job is running.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{new_job_id, JobId, Timestamp};

/// Exit code recorded when a job fails for reasons originating in the
/// supervising system (spawn failure, cancellation, store exhaustion)
/// rather than in the external process.
pub const INTERNAL_ERROR_EXIT_CODE: i32 = -1;

/// Upper bound of a valid progress percentage.
pub const MAX_PROGRESS: i16 = 100;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an allowed single-step transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Internal(format!("Unknown job status: {other}"))),
        }
    }
}

/// Which output pipe of the child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One tracked execution of the external command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub command: String,
    pub parameters: serde_json::Value,
    pub stdout: String,
    pub stderr: String,
    pub progress: i16,
    pub exit_code: Option<i32>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Build a fresh `pending` record with a newly allocated id.
    pub fn new(parameters: serde_json::Value, command: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: new_job_id(),
            status: JobStatus::Pending,
            command: command.into(),
            parameters,
            stdout: String::new(),
            stderr: String::new(),
            progress: 0,
            exit_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a mutation in place, rejecting anything that would break the
    /// lifecycle invariants. On error the record is left untouched.
    pub fn apply(&mut self, mutation: &JobMutation) -> Result<(), CoreError> {
        let next = mutation.next_status(self.status)?;

        match mutation {
            JobMutation::MarkRunning => {}
            JobMutation::AppendOutput {
                stream,
                line,
                progress,
            } => {
                push_line(self.output_mut(*stream), line);
                if let Some(p) = progress.filter(|p| is_valid_progress(*p)) {
                    self.progress = p;
                }
            }
            JobMutation::Finish { exit_code } => {
                self.exit_code = Some(*exit_code);
            }
            JobMutation::Fail { exit_code, reason } => {
                push_line(&mut self.stderr, reason);
                self.exit_code = Some(*exit_code);
            }
        }

        self.status = next;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Borrow the accumulator for one output stream.
    pub fn output(&self, stream: OutputStream) -> &str {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    fn output_mut(&mut self, stream: OutputStream) -> &mut String {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

fn push_line(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
}

/// Whether `value` is an acceptable progress percentage.
pub fn is_valid_progress(value: i16) -> bool {
    (0..=MAX_PROGRESS).contains(&value)
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// A single atomic change to a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMutation {
    /// `pending -> running`, issued right before the process is spawned.
    MarkRunning,
    /// Append one line to a stream and optionally update progress.
    AppendOutput {
        stream: OutputStream,
        line: String,
        progress: Option<i16>,
    },
    /// The process exited; zero completes the job, anything else fails it.
    Finish { exit_code: i32 },
    /// Fail the job, recording `reason` as a trailing stderr line.
    Fail { exit_code: i32, reason: String },
}

impl JobMutation {
    /// Compute the status a job in `current` would have after this mutation,
    /// or a [`CoreError::Conflict`] if the mutation is not allowed there.
    pub fn next_status(&self, current: JobStatus) -> Result<JobStatus, CoreError> {
        let next = match self {
            Self::MarkRunning => JobStatus::Running,
            Self::AppendOutput { .. } => {
                if current != JobStatus::Running {
                    return Err(CoreError::Conflict(format!(
                        "cannot append output to a {current} job"
                    )));
                }
                return Ok(current);
            }
            Self::Finish { exit_code: 0 } => JobStatus::Completed,
            Self::Finish { .. } | Self::Fail { .. } => JobStatus::Failed,
        };

        if !current.can_transition_to(next) {
            return Err(CoreError::Conflict(format!(
                "illegal status transition {current} -> {next}"
            )));
        }
        Ok(next)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MarkRunning => "mark_running",
            Self::AppendOutput { .. } => "append_output",
            Self::Finish { .. } => "finish",
            Self::Fail { .. } => "fail",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
