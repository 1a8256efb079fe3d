use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use deployd_core::job::{Job, OutputStream};
use deployd_core::types::JobId;
use deployd_db::{JobStore, StoreError};
use deployd_events::{JobEvent, JobEventBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use super::{frames, FrameSource};

const STREAMS: [OutputStream; 2] = [OutputStream::Stdout, OutputStream::Stderr];

fn stream_index(stream: OutputStream) -> usize {
    match stream {
        OutputStream::Stdout => 0,
        OutputStream::Stderr => 1,
    }
}

/// Follows one job for an attached client.
///
/// Keeps a cursor of lines already sent per stream. Live `Output` events at
/// the cursor are forwarded directly; anything that suggests a gap (a line
/// number past the cursor, a lagged receiver, the terminal event) is
/// resolved by reading the stored record and sending what is missing. The
/// store is written before events are published, so the record always holds
/// at least as much as the bus has delivered.
pub struct JobWatch {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    events: Receiver<JobEvent>,
    sent: [usize; 2],
    queued: VecDeque<String>,
    done: bool,
}

impl JobWatch {
    /// Attach to a job from the start of its output.
    pub async fn attach(
        store: Arc<dyn JobStore>,
        bus: &JobEventBus,
        job_id: JobId,
    ) -> Result<Self, StoreError> {
        // Subscribe before reading so nothing falls between the two.
        let events = bus.subscribe();
        let job = store.get(job_id).await?;

        let mut watch = Self::new(store, job_id, events, [0, 0]);
        watch.queued.push_back(frames::started(&job.command));
        watch.catch_up(&job);
        Ok(watch)
    }

    /// Continue a stream that already sent `sent` lines per stream.
    pub(crate) async fn resume(
        store: Arc<dyn JobStore>,
        bus: &JobEventBus,
        job_id: JobId,
        sent: [usize; 2],
    ) -> Self {
        let events = bus.subscribe();
        let mut watch = Self::new(store, job_id, events, sent);
        watch.refresh().await;
        watch
    }

    fn new(store: Arc<dyn JobStore>, job_id: JobId, events: Receiver<JobEvent>, sent: [usize; 2]) -> Self {
        Self {
            store,
            job_id,
            events,
            sent,
            queued: VecDeque::new(),
            done: false,
        }
    }

    /// Queue every stored line past the cursors, and the closing frames if
    /// the job is finished.
    fn catch_up(&mut self, job: &Job) {
        for stream in STREAMS {
            let sent = &mut self.sent[stream_index(stream)];
            for line in job.output(stream).split_terminator('\n').skip(*sent) {
                self.queued.push_back(frames::output(stream, line));
                *sent += 1;
            }
        }

        if let (true, Some(exit_code)) = (job.status.is_terminal(), job.exit_code) {
            self.close(frames::completed(exit_code));
        }
    }

    async fn refresh(&mut self) {
        match self.store.get(self.job_id).await {
            Ok(job) => self.catch_up(&job),
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Cannot read job for stream");
                self.close(frames::error(&e.to_string()));
            }
        }
    }

    fn close(&mut self, last: String) {
        self.queued.push_back(last);
        self.queued.push_back(frames::DONE.to_string());
        self.done = true;
    }

    async fn on_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Output {
                stream,
                line_no,
                line,
                ..
            } => {
                let sent = self.sent[stream_index(stream)];
                match usize::try_from(line_no) {
                    Ok(n) if n == sent => {
                        self.queued.push_back(frames::output(stream, &line));
                        self.sent[stream_index(stream)] += 1;
                    }
                    Ok(n) if n < sent => {}
                    _ => self.refresh().await,
                }
            }
            JobEvent::Finished { .. } => self.refresh().await,
            JobEvent::Started { .. } | JobEvent::Progress { .. } => {}
        }
    }
}

#[async_trait]
impl FrameSource for JobWatch {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            if self.done {
                return None;
            }

            match self.events.recv().await {
                Ok(event) if event.job_id() == self.job_id => self.on_event(event).await,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "Stream lagged, reading job");
                    self.refresh().await;
                }
                Err(RecvError::Closed) => {
                    self.refresh().await;
                    if !self.done {
                        self.close(frames::error("event stream closed"));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
