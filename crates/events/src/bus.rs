//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`JobEventBus`] fans out [`JobEvent`]s to every subscriber. It is shared
//! via `Arc<JobEventBus>` between the supervisor and the HTTP layer.

use deployd_core::job::{JobStatus, OutputStream};
use deployd_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// Something observable that happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The job entered `running` and its process is about to start.
    Started { job_id: JobId, command: String },

    /// One line was recorded on a stream. `line_no` is the zero-based index
    /// of the line within that stream, matching the stored accumulator.
    Output {
        job_id: JobId,
        stream: OutputStream,
        line_no: u64,
        line: String,
    },

    /// Progress was updated.
    Progress { job_id: JobId, percent: i16 },

    /// The job reached a terminal status. Always the last event of a job.
    Finished {
        job_id: JobId,
        status: JobStatus,
        exit_code: i32,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job_id, .. }
            | Self::Output { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Finished { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

// ---------------------------------------------------------------------------
// JobEventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for job events.
///
/// Publishing never blocks. A subscriber that falls more than the channel
/// capacity behind observes `RecvError::Lagged` and loses the oldest events;
/// the durable job record remains the source of truth.
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id() -> JobId {
        deployd_core::types::new_job_id()
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = JobEventBus::default();
        let mut rx = bus.subscribe();
        let id = job_id();

        bus.publish(JobEvent::Started {
            job_id: id,
            command: "nkp".into(),
        });
        bus.publish(JobEvent::Finished {
            job_id: id,
            status: JobStatus::Completed,
            exit_code: 0,
        });

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert!(matches!(first, JobEvent::Started { .. }));
        assert!(second.is_terminal());
        assert_eq!(second.job_id(), id);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = JobEventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.sender.receiver_count(), 2);

        let event = JobEvent::Progress {
            job_id: job_id(),
            percent: 45,
        };
        bus.publish(event.clone());

        assert_eq!(rx1.recv().await.expect("rx1"), event);
        assert_eq!(rx2.recv().await.expect("rx2"), event);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = JobEventBus::default();
        bus.publish(JobEvent::Progress {
            job_id: job_id(),
            percent: 1,
        });
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = JobEventBus::new(2);
        let mut rx = bus.subscribe();
        let id = job_id();
        for percent in 0..5 {
            bus.publish(JobEvent::Progress { job_id: id, percent });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn output_event_serializes_with_type_tag() {
        let id = job_id();
        let value = serde_json::to_value(JobEvent::Output {
            job_id: id,
            stream: OutputStream::Stderr,
            line_no: 3,
            line: "boom".into(),
        })
        .expect("serialize");
        assert_eq!(value["type"], "output");
        assert_eq!(value["stream"], "stderr");
        assert_eq!(value["line_no"], 3);
    }
}
