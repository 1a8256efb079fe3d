//! Text of the frames sent on job output streams.
//!
//! Every frame is a single SSE `data:` event. Clients render them verbatim;
//! `[DONE]` marks the end of the stream.

use axum::response::sse::Event;
use deployd_core::job::OutputStream;
use deployd_events::JobEvent;

/// Final frame of every stream.
pub const DONE: &str = "[DONE]";

pub fn started(command: &str) -> String {
    format!("Command started: {command}")
}

/// A captured line. Stderr lines carry an `ERROR: ` prefix.
pub fn output(stream: OutputStream, line: &str) -> String {
    match stream {
        OutputStream::Stdout => line.to_string(),
        OutputStream::Stderr => error(line),
    }
}

pub fn completed(exit_code: i32) -> String {
    format!("Command completed with return code: {exit_code}")
}

pub fn error(message: &str) -> String {
    format!("ERROR: {message}")
}

/// The frame for a job event, if it has one. Progress is already visible in
/// the output line it came from.
pub fn for_event(event: &JobEvent) -> Option<String> {
    match event {
        JobEvent::Started { command, .. } => Some(started(command)),
        JobEvent::Output { stream, line, .. } => Some(output(*stream, line)),
        JobEvent::Progress { .. } => None,
        JobEvent::Finished { exit_code, .. } => Some(completed(*exit_code)),
    }
}

/// Wrap frame text in an SSE event.
///
/// SSE field values cannot hold carriage returns, so they become line
/// breaks, which the event encodes as extra `data:` lines.
pub fn to_event(text: &str) -> Event {
    if text.contains('\r') {
        Event::default().data(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Event::default().data(text)
    }
}
