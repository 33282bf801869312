//! Adapter stdin writer task.
//!
//! Receives already-framed messages from a bounded [`mpsc`] channel and
//! writes them to the adapter's `stdin` in arrival order. The channel bound
//! is the backpressure: when the adapter stops reading, senders wait instead
//! of growing memory.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Writer task: drain `msg_rx` into `stdin` until cancelled or closed.
///
/// The task exits cleanly when:
/// - `cancel` is triggered (teardown), or
/// - `msg_rx` is closed (all senders dropped).
///
/// Either way `stdin` is dropped on return, which closes the pipe and gives
/// the adapter an EOF.
///
/// # Errors
///
/// Returns [`AppError::Write`] if a write or flush fails (e.g. the adapter
/// exited). The receiver is dropped with the task, so later sends observe
/// the closed channel.
pub async fn run_writer<W>(
    session_id: String,
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "adapter writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(bytes) = msg else {
                    debug!(session_id, "adapter writer: message channel closed, stopping");
                    break;
                };

                // A stalled adapter must not pin the task past teardown.
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => {
                        debug!(session_id, "adapter writer: cancelled mid-write, stopping");
                        break;
                    }

                    written = write_frame(&mut stdin, &bytes) => {
                        if let Err(err) = written {
                            warn!(session_id, error = %err, "adapter writer: write to stdin failed");
                            return Err(AppError::Write(format!("write to adapter stdin failed: {err}")));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn write_frame<W>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    stdin.write_all(bytes).await?;
    stdin.flush().await
}
