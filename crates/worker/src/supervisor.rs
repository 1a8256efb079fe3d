//! Job supervisor: one Tokio task per job, tracked until it finishes.
//!
//! Each submitted job gets an execution task and a watcher task. The watcher
//! owns the execution's join handle, so a panic inside the execution still
//! cancels the child process and leaves the job `failed`. Both are tracked
//! in a handle map keyed by job id, which is what [`JobSupervisor::cancel`]
//! and [`JobSupervisor::shutdown`] operate on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deployd_core::command::CommandLine;
use deployd_core::job::{
    Job, JobMutation, JobStatus, OutputStream, INTERNAL_ERROR_EXIT_CODE,
};
use deployd_core::process::{ProcessRun, ProcessRunner, RunnerEvent, DEFAULT_EVENT_BUFFER};
use deployd_core::progress::parse_progress;
use deployd_core::types::JobId;
use deployd_db::{JobStore, StoreError};
use deployd_events::{JobEvent, JobEventBus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::live::LiveSink;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Retry policy for every store write made while a job runs.
    pub retry: RetryPolicy,
    /// Jobs still running after this long are cancelled.
    pub max_duration: Option<Duration>,
    /// Events buffered between a process's pipes and its supervisor.
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_duration: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningJob {
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
}

/// Runs jobs and keeps their store records consistent with their processes.
pub struct JobSupervisor {
    store: Arc<dyn JobStore>,
    bus: Arc<JobEventBus>,
    runner: ProcessRunner,
    config: SupervisorConfig,
    running: Mutex<HashMap<JobId, RunningJob>>,
}

impl JobSupervisor {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<JobEventBus>, config: SupervisorConfig) -> Self {
        Self {
            store,
            bus,
            runner: ProcessRunner::new(config.event_buffer),
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a `pending` job for `command` and start it in the background.
    ///
    /// Returns the job as created, before the process has been spawned. When
    /// `live` is given, every event of this job is also delivered to it.
    pub async fn submit(
        self: &Arc<Self>,
        parameters: serde_json::Value,
        command: &CommandLine,
        live: Option<LiveSink>,
    ) -> Result<Job, StoreError> {
        let job = self.store.create(parameters, command.to_string()).await?;
        tracing::info!(job_id = %job.id, command = %job.command, "Job created");

        self.start(job.id, command.clone(), live).await;
        Ok(job)
    }

    async fn start(self: &Arc<Self>, job_id: JobId, command: CommandLine, live: Option<LiveSink>) {
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("job", job_id = %job_id);

        // Hold the map lock until the entry is in, so a fast job's watcher
        // cannot try to remove it first.
        let mut running = self.running.lock().await;
        let execution = tokio::spawn(
            Arc::clone(self)
                .execute(job_id, command, cancel.clone(), live)
                .instrument(span.clone()),
        );
        let watcher = tokio::spawn(
            Arc::clone(self)
                .watch(job_id, execution, cancel.clone())
                .instrument(span),
        );
        running.insert(job_id, RunningJob { cancel, watcher });
    }

    /// Request cancellation of a job started by this supervisor.
    ///
    /// Returns `false` if the job is not running here (unknown or finished).
    pub async fn cancel(&self, job_id: JobId) -> bool {
        match self.running.lock().await.get(&job_id) {
            Some(job) => {
                tracing::info!(job_id = %job_id, "Job cancellation requested");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Cancel every running job and wait up to `timeout` for them to record
    /// their final status.
    pub async fn shutdown(&self, timeout: Duration) {
        let jobs: Vec<RunningJob> = self.running.lock().await.drain().map(|(_, j)| j).collect();
        if jobs.is_empty() {
            return;
        }

        tracing::info!(count = jobs.len(), "Cancelling running jobs");
        let watchers: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                job.cancel.cancel();
                job.watcher
            })
            .collect();

        if tokio::time::timeout(timeout, futures::future::join_all(watchers))
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for jobs to finish",
            );
        }
    }

    /// Wait for an execution task and clean up after it.
    async fn watch(self: Arc<Self>, job_id: JobId, execution: JoinHandle<()>, cancel: CancellationToken) {
        if let Err(e) = execution.await {
            cancel.cancel();
            if e.is_panic() {
                tracing::error!(job_id = %job_id, "Job supervisor panicked, failing job");
                let reason = "Internal error: job supervisor panicked";
                if self.force_fail(job_id, reason).await {
                    self.bus.publish(JobEvent::Finished {
                        job_id,
                        status: JobStatus::Failed,
                        exit_code: INTERNAL_ERROR_EXIT_CODE,
                    });
                }
            } else {
                tracing::warn!(job_id = %job_id, "Job task was aborted");
            }
        }
        self.running.lock().await.remove(&job_id);
    }

    /// Best-effort transition of a non-terminal job to `failed` with the
    /// internal-error exit code. Returns whether the record was updated.
    async fn force_fail(&self, job_id: JobId, reason: &str) -> bool {
        let retry = &self.config.retry;
        let status = match retry.run("get", || self.store.get(job_id)).await {
            Ok(job) => job.status,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Cannot read job to fail it");
                return false;
            }
        };
        if status.is_terminal() {
            return false;
        }

        if status == JobStatus::Pending {
            let mark = JobMutation::MarkRunning;
            if let Err(e) = retry.run("mark_running", || self.store.apply_update(job_id, &mark)).await {
                tracing::error!(job_id = %job_id, error = %e, "Cannot fail job");
                return false;
            }
        }

        let fail = JobMutation::Fail {
            exit_code: INTERNAL_ERROR_EXIT_CODE,
            reason: reason.to_string(),
        };
        match retry.run("fail", || self.store.apply_update(job_id, &fail)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Cannot fail job");
                false
            }
        }
    }

    /// Drive one job from `pending` to a terminal status.
    async fn execute(
        self: Arc<Self>,
        job_id: JobId,
        command: CommandLine,
        cancel: CancellationToken,
        live: Option<LiveSink>,
    ) {
        let mut exec = Execution {
            supervisor: &self,
            job_id,
            live,
            lines: [0, 0],
        };

        if let Err(e) = exec.write(&JobMutation::MarkRunning).await {
            tracing::error!(error = %e, "Failed to mark job running");
            let reason = format!("Internal error: failed to start job: {e}");
            if self.force_fail(job_id, &reason).await {
                exec.announce_failure(&reason, INTERNAL_ERROR_EXIT_CODE).await;
            } else {
                exec.emit(finished(job_id, JobStatus::Failed, INTERNAL_ERROR_EXIT_CODE))
                    .await;
            }
            return;
        }
        exec.emit(JobEvent::Started {
            job_id,
            command: command.to_string(),
        })
        .await;

        if cancel.is_cancelled() {
            exec.fail("Job cancelled".into()).await;
            return;
        }

        let run = match self.runner.spawn(&command, cancel.clone()) {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to spawn process");
                exec.fail(format!("Failed to start command: {e}")).await;
                return;
            }
        };
        tracing::info!(pid = run.pid(), "Job running");

        exec.follow(run, &cancel).await;
    }
}

fn finished(job_id: JobId, status: JobStatus, exit_code: i32) -> JobEvent {
    JobEvent::Finished {
        job_id,
        status,
        exit_code,
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// State of one job's execution task.
struct Execution<'a> {
    supervisor: &'a JobSupervisor,
    job_id: JobId,
    live: Option<LiveSink>,
    /// Lines recorded so far, indexed by [`stream_index`].
    lines: [u64; 2],
}

fn stream_index(stream: OutputStream) -> usize {
    match stream {
        OutputStream::Stdout => 0,
        OutputStream::Stderr => 1,
    }
}

impl Execution<'_> {
    /// Consume the run's events until its terminal event.
    async fn follow(&mut self, mut run: ProcessRun, cancel: &CancellationToken) {
        let max_duration = self.supervisor.config.max_duration;
        let deadline = max_duration.map(|d| Instant::now() + d);
        let mut timed_out = false;

        loop {
            let next = match deadline {
                Some(deadline) if !timed_out => tokio::select! {
                    event = run.next_event() => event,
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::warn!("Job exceeded its maximum duration, cancelling");
                        timed_out = true;
                        cancel.cancel();
                        continue;
                    }
                },
                _ => run.next_event().await,
            };

            match next {
                Some(RunnerEvent::Line { stream, line }) => {
                    if let Err(e) = self.record_line(stream, line).await {
                        tracing::error!(error = %e, "Failed to record output, killing process");
                        cancel.cancel();
                        drop(run);
                        self.fail(format!("Internal error: failed to record output: {e}"))
                            .await;
                        return;
                    }
                }
                Some(RunnerEvent::Exited { code }) => {
                    self.finish(code).await;
                    return;
                }
                Some(RunnerEvent::Terminated { code, signal, reason }) => {
                    tracing::warn!(code, signal, %reason, "Process terminated abnormally");
                    let exit_code = if code == 0 { INTERNAL_ERROR_EXIT_CODE } else { code };
                    self.fail_with(exit_code, format!("Process terminated abnormally: {reason}"))
                        .await;
                    return;
                }
                Some(RunnerEvent::Cancelled) => {
                    let reason = match max_duration {
                        Some(d) if timed_out => format!("Job timed out after {}s", d.as_secs()),
                        _ => "Job cancelled".to_string(),
                    };
                    self.fail(reason).await;
                    return;
                }
                None => {
                    self.fail("Internal error: process output ended without an exit status".into())
                        .await;
                    return;
                }
            }
        }
    }

    async fn write(&self, mutation: &JobMutation) -> Result<JobStatus, StoreError> {
        let store = &self.supervisor.store;
        self.supervisor
            .config
            .retry
            .run(mutation.kind(), || store.apply_update(self.job_id, mutation))
            .await
    }

    /// Publish on the bus and deliver to the live client, if any.
    async fn emit(&mut self, event: JobEvent) {
        self.supervisor.bus.publish(event.clone());
        if let Some(live) = &self.live {
            if !live.send(event).await {
                self.live = None;
            }
        }
    }

    async fn emit_line(&mut self, stream: OutputStream, line: String) {
        let counter = &mut self.lines[stream_index(stream)];
        let line_no = *counter;
        *counter += 1;
        self.emit(JobEvent::Output {
            job_id: self.job_id,
            stream,
            line_no,
            line,
        })
        .await;
    }

    /// Append one line, with any progress it carries, as a single write.
    async fn record_line(&mut self, stream: OutputStream, line: String) -> Result<(), StoreError> {
        let progress = match stream {
            OutputStream::Stdout => parse_progress(&line),
            OutputStream::Stderr => None,
        };
        let mutation = JobMutation::AppendOutput {
            stream,
            line,
            progress,
        };
        self.write(&mutation).await?;

        if let JobMutation::AppendOutput { line, .. } = mutation {
            self.emit_line(stream, line).await;
        }
        if let Some(percent) = progress {
            self.emit(JobEvent::Progress {
                job_id: self.job_id,
                percent,
            })
            .await;
        }
        Ok(())
    }

    /// Record a natural exit.
    async fn finish(&mut self, exit_code: i32) {
        match self.write(&JobMutation::Finish { exit_code }).await {
            Ok(status) => {
                tracing::info!(exit_code, status = %status, "Job finished");
                self.emit(finished(self.job_id, status, exit_code)).await;
            }
            Err(e) => {
                tracing::error!(exit_code, error = %e, "Failed to record exit code");
                self.fail(format!(
                    "Internal error: failed to record exit code {exit_code}: {e}"
                ))
                .await;
            }
        }
    }

    async fn fail(&mut self, reason: String) {
        self.fail_with(INTERNAL_ERROR_EXIT_CODE, reason).await;
    }

    async fn fail_with(&mut self, exit_code: i32, reason: String) {
        let mutation = JobMutation::Fail {
            exit_code,
            reason: reason.clone(),
        };
        match self.write(&mutation).await {
            Ok(_) => {
                tracing::info!(exit_code, %reason, "Job failed");
                self.announce_failure(&reason, exit_code).await;
            }
            Err(e) => {
                tracing::error!(exit_code, error = %e, "Failed to record job failure");
                self.emit(finished(self.job_id, JobStatus::Failed, exit_code))
                    .await;
            }
        }
    }

    /// Events for a failure already written to the store: the reason line
    /// it appended to stderr, then the terminal event.
    async fn announce_failure(&mut self, reason: &str, exit_code: i32) {
        self.emit_line(OutputStream::Stderr, reason.to_string()).await;
        self.emit(finished(self.job_id, JobStatus::Failed, exit_code))
            .await;
    }
}
