//! Moves bytes between a channel and a session's terminal.
//!
//! Output runs on a dedicated blocking task that polls the controller with a
//! bounded wait, so cancellation is noticed within one poll interval. Input
//! is dispatched from the channel task in arrival order.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use protocol::{ClientMessage, InboundFrame, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::handle::{Activity, Session};
use super::pty::{PtyReader, SessionError, SessionId, WindowSize};

/// Bytes read from the controller per call.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Default bound on a single readiness wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Output events queued between the reader and the channel.
pub const OUTPUT_QUEUE_CAPACITY: usize = 256;

/// Events produced by a session's reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Decoded terminal output.
    Output(String),
    /// The reader stopped. Always the last event.
    Exit,
}

impl From<ReaderEvent> for ServerMessage {
    fn from(event: ReaderEvent) -> Self {
        match event {
            ReaderEvent::Output(data) => ServerMessage::Output { data },
            ReaderEvent::Exit => ServerMessage::Exit,
        }
    }
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte sequence split across reads is held back until the rest
/// arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `input` after any held-back bytes.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(input);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes held-back bytes at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(tail)
    }
}

#[derive(Debug)]
enum StopReason {
    Cancelled,
    EndOfStream,
    ChannelGone,
    Failed(io::Error),
}

/// Reads terminal output until EOF, error or cancellation.
///
/// Sends exactly one [`ReaderEvent::Exit`] as its last event.
pub fn run_reader(
    mut reader: PtyReader,
    tx: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
    activity: Arc<Activity>,
    poll_interval: Duration,
    session_id: SessionId,
) {
    let mut decoder = Utf8Decoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        match reader.wait_readable(poll_interval) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => break StopReason::Failed(e),
        }

        match reader.read(&mut buf) {
            Ok(0) => break StopReason::EndOfStream,
            Ok(n) => {
                activity.touch();
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && tx.blocking_send(ReaderEvent::Output(text)).is_err() {
                    break StopReason::ChannelGone;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            // Linux reports a hung-up terminal as EIO.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break StopReason::EndOfStream,
            Err(e) => break StopReason::Failed(e),
        }
    };
    drop(reader);

    match &reason {
        StopReason::Failed(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Terminal read failed");
        }
        other => {
            tracing::debug!(session_id = %session_id, reason = ?other, "Reader stopped");
        }
    }

    if matches!(reason, StopReason::ChannelGone) {
        return;
    }
    if let Some(tail) = decoder.finish() {
        let _ = tx.blocking_send(ReaderEvent::Output(tail));
    }
    let _ = tx.blocking_send(ReaderEvent::Exit);
}

/// Starts the reader for `session` on the blocking pool.
pub fn spawn_reader(
    session: &Session,
    reader: PtyReader,
    poll_interval: Duration,
) -> (mpsc::Receiver<ReaderEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
    let cancel = session.cancellation().clone();
    let activity = Arc::clone(session.activity());
    let session_id = session.id().clone();
    let task = tokio::task::spawn_blocking(move || {
        run_reader(reader, tx, cancel, activity, poll_interval, session_id)
    });
    (rx, task)
}

/// What the channel should do after an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing to send.
    Continue,
    /// Send this reply.
    Reply(ServerMessage),
    /// The peer broke the protocol. Send an error and close.
    Violation(String),
}

/// Applies inbound frames to one session.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    raw_input_fallback: bool,
}

impl Dispatcher {
    /// Creates a dispatcher. With `raw_input_fallback`, text that is not a
    /// message is written to the shell as typed input.
    pub fn new(session: Arc<Session>, raw_input_fallback: bool) -> Self {
        Self {
            session,
            raw_input_fallback,
        }
    }

    /// Handles a text frame.
    pub async fn dispatch(&self, frame: InboundFrame) -> Result<Dispatch, SessionError> {
        match frame {
            InboundFrame::Message(ClientMessage::Input { data }) => {
                self.session.write(data.into_bytes()).await?;
                Ok(Dispatch::Continue)
            }
            InboundFrame::Message(ClientMessage::Resize { rows, cols }) => {
                if rows == 0 || cols == 0 {
                    tracing::debug!(session_id = %self.session.id(), rows, cols, "Ignoring empty resize");
                    return Ok(Dispatch::Continue);
                }
                self.session.resize(WindowSize::new(rows, cols))?;
                Ok(Dispatch::Continue)
            }
            InboundFrame::Message(ClientMessage::Ping) => Ok(Dispatch::Reply(ServerMessage::Pong)),
            InboundFrame::Message(ClientMessage::Auth { .. }) => {
                Ok(Dispatch::Violation("Protocol violation: already authenticated".to_string()))
            }
            InboundFrame::Raw(text) if self.raw_input_fallback => {
                self.session.write(text.into_bytes()).await?;
                Ok(Dispatch::Continue)
            }
            InboundFrame::Raw(text) => {
                tracing::warn!(
                    session_id = %self.session.id(),
                    len = text.len(),
                    "Dropping malformed frame"
                );
                Ok(Dispatch::Continue)
            }
        }
    }

    /// Handles a binary frame: its bytes are typed input.
    pub async fn dispatch_binary(&self, data: Vec<u8>) -> Result<Dispatch, SessionError> {
        self.session.write(data).await?;
        Ok(Dispatch::Continue)
    }
}
