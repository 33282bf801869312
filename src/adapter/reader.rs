//! Adapter output tasks.
//!
//! - [`run_outbound_pump`] feeds stdout chunks through a [`FrameCodec`] and
//!   forwards each complete frame to the session over a bounded channel.
//! - [`drain_diagnostics`] logs stderr line by line and keeps a bounded tail
//!   for crash reports. Stderr is never forwarded to the client.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::framing::{Frame, FrameCodec, FrameError};

/// Why the stdout pump stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// The adapter closed stdout.
    Eof,
    /// Teardown cancelled the pump.
    Cancelled,
    /// The session stopped receiving frames.
    ReceiverClosed,
    /// Framing could not continue (overflow or read error).
    Fatal(FrameError),
}

/// Stdout pump: decode frames from `chunks` and send them on `frame_tx`.
///
/// Header blocks without a usable length are dropped and logged; decoding
/// resumes after them. Frames are sent in the order the adapter wrote them.
pub async fn run_outbound_pump<S>(
    session_id: String,
    mut chunks: S,
    mut codec: FrameCodec,
    frame_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> PumpEnd
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    loop {
        let chunk = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "outbound pump: cancellation received, stopping");
                return PumpEnd::Cancelled;
            }

            chunk = chunks.next() => chunk,
        };

        let bytes = match chunk {
            None => {
                debug!(session_id, "outbound pump: adapter stdout closed");
                return PumpEnd::Eof;
            }
            Some(Err(err)) => {
                warn!(session_id, error = %err, "outbound pump: stdout read failed");
                return PumpEnd::Fatal(FrameError::Io(err));
            }
            Some(Ok(bytes)) => bytes,
        };

        for item in codec.feed(&bytes) {
            match item {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        debug!(session_id, "outbound pump: frame receiver closed, stopping");
                        return PumpEnd::ReceiverClosed;
                    }
                }
                Err(err) if err.is_fatal() => {
                    warn!(session_id, error = %err, "outbound pump: fatal framing error");
                    return PumpEnd::Fatal(err);
                }
                Err(err) => {
                    warn!(
                        session_id,
                        error = %err,
                        "outbound pump: dropped malformed header block"
                    );
                }
            }
        }
    }
}

/// Trailing bytes of an adapter's stderr.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticTail {
    limit: usize,
    bytes: VecDeque<u8>,
}

impl DiagnosticTail {
    /// Empty tail that retains at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            bytes: VecDeque::with_capacity(limit.min(4096)),
        }
    }

    /// Append `chunk`, discarding the oldest bytes beyond the limit.
    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.limit);
        self.bytes.drain(..excess);
    }

    /// Retained bytes as lossy UTF-8, trailing whitespace trimmed.
    #[must_use]
    pub fn text(&self) -> String {
        let raw: Vec<u8> = self.bytes.iter().copied().collect();
        String::from_utf8_lossy(&raw).trim_end().to_owned()
    }
}

/// Stderr drain: log each line at `DEBUG` and return the retained tail.
///
/// Runs until the adapter closes stderr or `cancel` fires.
pub async fn drain_diagnostics<S>(
    session_id: String,
    mut chunks: S,
    tail_limit: usize,
    cancel: CancellationToken,
) -> DiagnosticTail
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    let mut tail = DiagnosticTail::new(tail_limit);
    let mut line = Vec::new();

    loop {
        let chunk = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            chunk = chunks.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                tail.push(&bytes);
                line.extend_from_slice(&bytes);
                while let Some(pos) = line.iter().position(|b| *b == b'\n') {
                    let complete: Vec<u8> = line.drain(..=pos).collect();
                    log_stderr_line(&session_id, &complete);
                }
                if line.len() > tail_limit {
                    log_stderr_line(&session_id, &line);
                    line.clear();
                }
            }
            Some(Err(err)) => {
                debug!(session_id, error = %err, "stderr drain: read failed");
                break;
            }
            None => break,
        }
    }

    if !line.is_empty() {
        log_stderr_line(&session_id, &line);
    }
    tail
}

fn log_stderr_line(session_id: &str, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end();
    if !text.is_empty() {
        debug!(session_id, stderr = %text, "adapter stderr");
    }
}
