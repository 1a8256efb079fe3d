//! Child process runner that streams output line by line.
//!
//! [`ProcessRunner::spawn`] starts a [`CommandLine`] with both output pipes
//! captured and hands back a [`ProcessRun`]: a bounded, finite, one-shot
//! sequence of [`RunnerEvent`]s ending in exactly one terminal event.
//!
//! The child handle is owned by a single driver task. The child leads its own
//! process group. When the run ends, however it ends, the whole group is
//! killed and the child reaped, so no descendant outlives the run;
//! `kill_on_drop` covers the driver task itself being torn down.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::command::CommandLine;
use crate::job::{OutputStream, INTERNAL_ERROR_EXIT_CODE};

/// Default number of events buffered between the read loop and the consumer.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// How long output pipes may stay open after the child exits. A background
/// descendant holding them open does not keep the run alive past this.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Offset added to a signal number to form a shell-style exit code.
const SIGNAL_EXIT_BASE: i32 = 128;

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// One item produced by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// A complete line (delimiter stripped) read from one of the pipes.
    Line { stream: OutputStream, line: String },
    /// The process exited on its own with `code`.
    Exited { code: i32 },
    /// The process ended abnormally: killed by a signal, or its output could
    /// not be read to the end.
    Terminated {
        code: i32,
        signal: Option<i32>,
        reason: String,
    },
    /// The run was cancelled and the child killed.
    Cancelled,
}

impl RunnerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Line { .. })
    }
}

/// The command could not be started at all.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Command not found: {program}")]
    NotFound { program: String },

    #[error("Permission denied: {program}")]
    PermissionDenied { program: String },

    #[error("Failed to start {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    fn from_io(program: &str, err: std::io::Error) -> Self {
        let program = program.to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { program },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            _ => Self::Io {
                program,
                source: err,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Spawns commands and exposes their output as a stream of events.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    buffer: usize,
}

impl ProcessRunner {
    /// `buffer` bounds how many unread events may queue up before the read
    /// loop stops pulling from the pipes.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Start `command`. Fails immediately if the process cannot be spawned.
    pub fn spawn(
        &self,
        command: &CommandLine,
        cancel: CancellationToken,
    ) -> Result<ProcessRun, SpawnError> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(&command.program, e))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(self.buffer);
        let stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

        tracing::debug!(program = %command.program, pid, "Process spawned");
        tokio::spawn(drive(child, pid, stdout, stderr, tx, cancel));

        Ok(ProcessRun { pid, events: rx })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Handle to a running process's event sequence.
///
/// Dropping it kills the process if it is still alive.
#[derive(Debug)]
pub struct ProcessRun {
    pid: Option<u32>,
    events: mpsc::Receiver<RunnerEvent>,
}

impl ProcessRun {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<RunnerEvent> {
        self.events.recv().await
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Lines<R> = Option<Split<BufReader<R>>>;

/// Outcome of the read loop when it stops early.
enum Interrupt {
    Cancelled,
    Abandoned,
}

async fn drive<O, E>(
    mut child: Child,
    pid: Option<u32>,
    mut stdout: Lines<O>,
    mut stderr: Lines<E>,
    tx: mpsc::Sender<RunnerEvent>,
    cancel: CancellationToken,
) where
    O: tokio::io::AsyncRead + Unpin,
    E: tokio::io::AsyncRead + Unpin,
{
    let mut read_error = None;
    let mut status: Option<std::io::Result<ExitStatus>> = None;
    let mut drain_deadline: Option<Instant> = None;

    let interrupted = loop {
        if status.is_some() && stdout.is_none() && stderr.is_none() {
            break None;
        }

        let (stream, next) = tokio::select! {
            _ = cancel.cancelled() => {
                // Once the child has exited only the leftover output is lost.
                if status.is_some() {
                    break None;
                }
                break Some(Interrupt::Cancelled);
            }
            _ = tx.closed() => break Some(Interrupt::Abandoned),
            exited = child.wait(), if status.is_none() => {
                status = Some(exited);
                drain_deadline = Some(Instant::now() + OUTPUT_DRAIN_GRACE);
                continue;
            }
            _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                tracing::debug!(pid, "Output still open after exit, closing pipes");
                stdout = None;
                stderr = None;
                continue;
            }
            r = next_segment(&mut stdout), if stdout.is_some() => (OutputStream::Stdout, r),
            r = next_segment(&mut stderr), if stderr.is_some() => (OutputStream::Stderr, r),
        };

        match next {
            Ok(Some(bytes)) => {
                let event = RunnerEvent::Line {
                    stream,
                    line: decode_line(&bytes),
                };
                tokio::select! {
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break Some(Interrupt::Abandoned);
                        }
                    }
                    _ = cancel.cancelled(), if status.is_none() => break Some(Interrupt::Cancelled),
                }
            }
            Ok(None) => close(stream, &mut stdout, &mut stderr),
            Err(e) => {
                tracing::warn!(stream = stream.as_str(), error = %e, "Failed to read process output");
                read_error = Some(format!("failed to read {}: {e}", stream.as_str()));
                close(stream, &mut stdout, &mut stderr);
            }
        }
    };

    // Descendants left behind by the child go down with its process group.
    kill_group(pid);

    match (interrupted, status) {
        (None, Some(exited)) => {
            let event = match exited {
                Ok(status) => exit_event(status, read_error),
                Err(e) => RunnerEvent::Terminated {
                    code: INTERNAL_ERROR_EXIT_CODE,
                    signal: None,
                    reason: format!("failed to wait for process: {e}"),
                },
            };
            tracing::debug!(?event, "Process finished");
            let _ = tx.send(event).await;
        }
        (None, None) => {}
        (Some(Interrupt::Cancelled), exited) => {
            if exited.is_none() {
                reap(&mut child).await;
            }
            let _ = tx.send(RunnerEvent::Cancelled).await;
        }
        (Some(Interrupt::Abandoned), exited) => {
            tracing::warn!(pid, "Event consumer went away, killing process");
            if exited.is_none() {
                reap(&mut child).await;
            }
        }
    }
}

async fn next_segment<R>(lines: &mut Option<Split<R>>) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_segment().await,
        None => std::future::pending().await,
    }
}

fn close<O, E>(stream: OutputStream, stdout: &mut Lines<O>, stderr: &mut Lines<E>) {
    match stream {
        OutputStream::Stdout => *stdout = None,
        OutputStream::Stderr => *stderr = None,
    }
}

/// Lossy UTF-8 decode with a trailing `\r` removed. NUL bytes become
/// U+FFFD, since PostgreSQL text columns reject them.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let line = String::from_utf8_lossy(bytes);
    if line.contains('\0') {
        line.replace('\0', "\u{FFFD}")
    } else {
        line.into_owned()
    }
}

/// Kill the child and reap it.
async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(pid = child.id(), error = %e, "Failed to kill process");
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn exit_event(status: ExitStatus, read_error: Option<String>) -> RunnerEvent {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return RunnerEvent::Terminated {
                code: SIGNAL_EXIT_BASE + signal,
                signal: Some(signal),
                reason: format!("killed by signal {signal}"),
            };
        }
    }

    match (status.code(), read_error) {
        (Some(code), None) => RunnerEvent::Exited { code },
        (code, Some(reason)) => RunnerEvent::Terminated {
            code: code.unwrap_or(INTERNAL_ERROR_EXIT_CODE),
            signal: None,
            reason,
        },
        (None, None) => RunnerEvent::Terminated {
            code: INTERNAL_ERROR_EXIT_CODE,
            signal: None,
            reason: "process exited without a status code".into(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh", ["-c", script])
    }

    async fn collect(mut run: ProcessRun) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            events.push(event);
        }
        events
    }

    fn lines(events: &[RunnerEvent], wanted: OutputStream) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RunnerEvent::Line { stream, line } if *stream == wanted => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn streams_lines_then_exit_code() {
        let run = ProcessRunner::default()
            .spawn(&sh("echo one; echo two; echo oops >&2"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;

        assert_eq!(lines(&events, OutputStream::Stdout), vec!["one", "two"]);
        assert_eq!(lines(&events, OutputStream::Stderr), vec!["oops"]);
        assert_eq!(events.last(), Some(&RunnerEvent::Exited { code: 0 }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let run = ProcessRunner::default()
            .spawn(&sh("echo boom >&2; exit 2"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;

        assert_eq!(lines(&events, OutputStream::Stderr), vec!["boom"]);
        assert_eq!(events.last(), Some(&RunnerEvent::Exited { code: 2 }));
    }

    #[tokio::test]
    async fn unterminated_last_line_is_emitted() {
        let run = ProcessRunner::default()
            .spawn(&sh("printf 'partial'"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;
        assert_eq!(lines(&events, OutputStream::Stdout), vec!["partial"]);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let result = ProcessRunner::default().spawn(
            &CommandLine::new("definitely-not-a-real-binary-xyz", Vec::<String>::new()),
            CancellationToken::new(),
        );
        assert_matches!(result, Err(SpawnError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let mut run = ProcessRunner::default()
            .spawn(&sh("echo started; exec sleep 30"), cancel.clone())
            .expect("spawn");

        assert_matches!(
            run.next_event().await,
            Some(RunnerEvent::Line { line, .. }) if line == "started"
        );
        cancel.cancel();

        let rest = tokio::time::timeout(Duration::from_secs(5), collect(run))
            .await
            .expect("cancellation should end the run promptly");
        assert_eq!(rest, vec![RunnerEvent::Cancelled]);
    }

    #[tokio::test]
    async fn signal_death_is_abnormal_termination() {
        let run = ProcessRunner::default()
            .spawn(&sh("echo before; kill -9 $$"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;

        assert_eq!(lines(&events, OutputStream::Stdout), vec!["before"]);
        assert_matches!(
            events.last(),
            Some(RunnerEvent::Terminated { code: 137, signal: Some(9), .. })
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let run = ProcessRunner::default()
            .spawn(&sh(r"printf 'a\377b\r\n'"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;
        assert_eq!(lines(&events, OutputStream::Stdout), vec!["a\u{FFFD}b"]);
    }

    #[tokio::test]
    async fn nul_bytes_are_replaced() {
        let run = ProcessRunner::default()
            .spawn(&sh(r"printf 'a\000b\n'"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;
        assert_eq!(lines(&events, OutputStream::Stdout), vec!["a\u{FFFD}b"]);
    }

    /// Whether `pid` has exited (gone, or a zombie awaiting its new parent).
    #[cfg(target_os = "linux")]
    async fn exits_soon(pid: &str) -> bool {
        for _ in 0..100 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => return true,
                Ok(stat) => {
                    let state = stat
                        .rsplit_once(") ")
                        .and_then(|(_, rest)| rest.chars().next());
                    if state == Some('Z') {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn background_descendant_does_not_hold_the_run_open() {
        let run = ProcessRunner::default()
            .spawn(&sh("echo hi; sleep 30 & echo $!"), CancellationToken::new())
            .expect("spawn");

        let events = tokio::time::timeout(Duration::from_secs(5), collect(run))
            .await
            .expect("run should end once the shell exits");
        let out = lines(&events, OutputStream::Stdout);
        assert_eq!(out[0], "hi");
        assert_eq!(events.last(), Some(&RunnerEvent::Exited { code: 0 }));
        assert!(exits_soon(&out[1]).await, "background sleep {} survived", out[1]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancellation_kills_grandchildren() {
        let cancel = CancellationToken::new();
        let mut run = ProcessRunner::default()
            .spawn(&sh("sleep 30 & echo $!; wait"), cancel.clone())
            .expect("spawn");

        let grandchild = match run.next_event().await {
            Some(RunnerEvent::Line { line, .. }) => line,
            other => panic!("expected the background pid, got {other:?}"),
        };
        cancel.cancel();

        let rest = tokio::time::timeout(Duration::from_secs(5), collect(run))
            .await
            .expect("cancellation should end the run promptly");
        assert_eq!(rest, vec![RunnerEvent::Cancelled]);
        assert!(exits_soon(&grandchild).await, "grandchild {grandchild} survived");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_the_run_kills_the_process_group() {
        let mut run = ProcessRunner::default()
            .spawn(&sh("sleep 30 & echo $!; wait"), CancellationToken::new())
            .expect("spawn");

        let grandchild = match run.next_event().await {
            Some(RunnerEvent::Line { line, .. }) => line,
            other => panic!("expected the background pid, got {other:?}"),
        };
        drop(run);

        assert!(exits_soon(&grandchild).await, "grandchild {grandchild} survived");
    }

    #[tokio::test]
    async fn small_buffer_applies_backpressure_without_losing_lines() {
        let run = ProcessRunner::new(1)
            .spawn(&sh("for i in 1 2 3 4 5 6 7 8 9 10; do echo $i; done"), CancellationToken::new())
            .expect("spawn");
        let events = collect(run).await;
        let expected: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        assert_eq!(lines(&events, OutputStream::Stdout), expected);
    }
}
