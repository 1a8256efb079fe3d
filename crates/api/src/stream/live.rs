use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use deployd_core::job::OutputStream;
use deployd_core::types::JobId;
use deployd_db::JobStore;
use deployd_events::{JobEvent, JobEventBus};
use tokio::sync::mpsc;

use super::watch::JobWatch;
use super::{frames, FrameSource};

/// Frames for the client that submitted a job.
///
/// Reads the supervisor's dedicated channel for this client. If that channel
/// closes before the terminal event (the supervisor gave up on this client,
/// or its task died), the feed hands over to a [`JobWatch`] resumed at the
/// lines already sent.
pub struct LiveFeed {
    events: mpsc::Receiver<JobEvent>,
    store: Arc<dyn JobStore>,
    bus: Arc<JobEventBus>,
    job_id: JobId,
    sent: [usize; 2],
    queued: VecDeque<String>,
    done: bool,
    fallback: Option<JobWatch>,
}

impl LiveFeed {
    pub fn new(
        events: mpsc::Receiver<JobEvent>,
        store: Arc<dyn JobStore>,
        bus: Arc<JobEventBus>,
        job_id: JobId,
    ) -> Self {
        Self {
            events,
            store,
            bus,
            job_id,
            sent: [0, 0],
            queued: VecDeque::new(),
            done: false,
            fallback: None,
        }
    }

    fn on_event(&mut self, event: &JobEvent) {
        if let JobEvent::Output { stream, .. } = event {
            let index = match stream {
                OutputStream::Stdout => 0,
                OutputStream::Stderr => 1,
            };
            self.sent[index] += 1;
        }
        if let Some(frame) = frames::for_event(event) {
            self.queued.push_back(frame);
        }
        if event.is_terminal() {
            self.queued.push_back(frames::DONE.to_string());
            self.done = true;
        }
    }
}

#[async_trait]
impl FrameSource for LiveFeed {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            if let Some(watch) = &mut self.fallback {
                return watch.next_frame().await;
            }
            if self.done {
                return None;
            }

            match self.events.recv().await {
                Some(event) => self.on_event(&event),
                None => {
                    tracing::debug!(job_id = %self.job_id, "Live channel closed early, following job");
                    let watch =
                        JobWatch::resume(Arc::clone(&self.store), &self.bus, self.job_id, self.sent)
                            .await;
                    self.fallback = Some(watch);
                }
            }
        }
    }
}
