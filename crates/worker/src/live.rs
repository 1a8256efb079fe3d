//! Per-client delivery channel for the submitting client's live stream.

use std::time::Duration;

use deployd_events::JobEvent;
use tokio::sync::mpsc;

/// Default number of events queued for a live client.
pub const DEFAULT_LIVE_BUFFER: usize = 256;

/// Sending half of a live stream.
///
/// The supervisor waits for the client to make room, but never longer than
/// `send_timeout`; after that, or once the client has gone away, the sink is
/// dropped and the job carries on without it.
#[derive(Debug)]
pub struct LiveSink {
    tx: mpsc::Sender<JobEvent>,
    send_timeout: Duration,
}

impl LiveSink {
    /// Create a sink and the receiver the HTTP layer reads from.
    pub fn channel(buffer: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx, send_timeout }, rx)
    }

    /// Deliver one event. Returns `false` if the client should be dropped.
    pub async fn send(&self, event: JobEvent) -> bool {
        match tokio::time::timeout(self.send_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::debug!("Live client disconnected");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Live client stopped reading, dropping it",
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> JobEvent {
        JobEvent::Progress {
            job_id: deployd_core::types::new_job_id(),
            percent: 10,
        }
    }

    #[tokio::test]
    async fn delivers_while_client_reads() {
        let (sink, mut rx) = LiveSink::channel(4, Duration::from_secs(1));
        assert!(sink.send(event()).await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_client_is_dropped() {
        let (sink, rx) = LiveSink::channel(4, Duration::from_secs(1));
        drop(rx);
        assert!(!sink.send(event()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_times_out() {
        let (sink, _rx) = LiveSink::channel(1, Duration::from_millis(50));
        assert!(sink.send(event()).await);
        assert!(!sink.send(event()).await);
    }
}
