//! Stream gateway: job output as server-sent events.
//!
//! Two frame sources feed the same SSE encoding:
//!
//! - [`LiveFeed`] serves the client that submitted a job, straight from the
//!   supervisor's per-client channel.
//! - [`JobWatch`] serves any client attaching to an existing job: it replays
//!   the stored output and then follows the event bus.
//!
//! Both end with a completion frame and [`frames::DONE`]. A client going
//! away only ends its own stream, never the job.

pub mod frames;
mod live;
mod watch;

use std::convert::Infallible;

use async_trait::async_trait;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;

pub use live::LiveFeed;
pub use watch::JobWatch;

/// Something that yields frame text until the stream is over.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn next_frame(&mut self) -> Option<String>;
}

/// Serve `source` as an SSE response.
pub fn sse<S: FrameSource>(source: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = futures::stream::unfold(source, |mut source| async move {
        let frame = source.next_frame().await?;
        Some((Ok(frames::to_event(&frame)), source))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
