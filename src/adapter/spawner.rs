//! Adapter process spawner and supervisor.
//!
//! Launches one adapter process per session with:
//! - `kill_on_drop(true)` so no exit path leaks a running child.
//! - Piped stdio: stdin fed by a bounded writer task, stdout and stderr
//!   handed out once as chunk streams.
//! - A supervisor task that owns the [`Child`], publishes its exit on a
//!   [`watch`] channel, and performs the graceful-then-forced shutdown when
//!   asked to terminate.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::writer::run_writer;
use crate::config::SessionConfig;
use crate::registry::AdapterDescriptor;
use crate::{AppError, Result};

// ── Configuration ────────────────────────────────────────────────────────────

/// Limits applied to every spawned adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSettings {
    /// Time between the termination signal and a forced kill.
    pub grace_period: Duration,
    /// Capacity of the bounded stdin queue, in messages.
    pub write_queue_capacity: usize,
}

impl From<&SessionConfig> for ProcessSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            write_queue_capacity: config.write_queue_capacity,
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

// ── Exit report ──────────────────────────────────────────────────────────────

/// How an adapter process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, absent when killed by a signal or unknown.
    pub code: Option<i32>,
    /// `true` when the bridge asked the process to stop.
    pub requested: bool,
    /// `true` when the grace period ran out and the process was killed.
    pub forced: bool,
    /// Human-readable summary.
    pub reason: String,
}

impl ExitReport {
    fn from_wait(result: std::io::Result<ExitStatus>, requested: bool, forced: bool) -> Self {
        let (code, reason) = match result {
            Ok(status) => {
                let code = status.code();
                let reason = code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                (code, reason)
            }
            Err(err) => (None, format!("wait error: {err}")),
        };
        Self {
            code,
            requested,
            forced,
            reason,
        }
    }

    fn lost() -> Self {
        Self {
            code: None,
            requested: false,
            forced: false,
            reason: "exit status unavailable".to_owned(),
        }
    }

    /// Whether the process ended without the bridge asking it to.
    #[must_use]
    pub const fn is_unexpected(&self) -> bool {
        !self.requested
    }
}

// ── Process handle ───────────────────────────────────────────────────────────

/// One running adapter process, exclusively owned by its session.
///
/// Dropping the handle requests termination; the supervisor task finishes
/// the shutdown in the background.
#[derive(Debug)]
pub struct AdapterProcess {
    session_id: String,
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<Bytes>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stop: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl AdapterProcess {
    /// Launch `descriptor` for `session_id`.
    ///
    /// The exec call runs on the blocking pool so the caller's task keeps
    /// servicing its client while the OS starts the process.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the executable is missing or the OS rejected
    ///   the exec call.
    /// - `AppError::Spawn` if a stdio pipe was not created.
    pub async fn spawn(
        session_id: &str,
        descriptor: &AdapterDescriptor,
        settings: ProcessSettings,
    ) -> Result<Self> {
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = tokio::task::spawn_blocking(move || cmd.spawn())
            .await
            .map_err(|err| AppError::Spawn(format!("spawn task failed: {err}")))?
            .map_err(|err| {
                AppError::Spawn(format!(
                    "failed to spawn '{}': {err}",
                    descriptor.command
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture adapter stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture adapter stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture adapter stderr".into()))?;

        let pid = child.id();
        info!(
            session_id,
            pid = pid.unwrap_or(0),
            capability = %descriptor.capability_id,
            command = %descriptor.command,
            "adapter process spawned"
        );

        let stop = CancellationToken::new();
        let (stdin_tx, stdin_rx) = mpsc::channel(settings.write_queue_capacity.max(1));
        tokio::spawn(run_writer(
            session_id.to_owned(),
            stdin,
            stdin_rx,
            stop.child_token(),
        ));

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            session_id.to_owned(),
            child,
            stop.clone(),
            settings.grace_period,
            exit_tx,
        ));

        Ok(Self {
            session_id: session_id.to_owned(),
            pid,
            stdin_tx,
            stdout: Some(stdout),
            stderr: Some(stderr),
            stop,
            exit_rx,
        })
    }

    /// OS process id, if the OS reported one.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue framed bytes for the adapter's stdin.
    ///
    /// Waits when the bounded queue is full.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Write` once the process has exited or its stdin
    /// writer has stopped; writes to a dead process are never silent.
    pub async fn write_inbound(&self, bytes: Bytes) -> Result<()> {
        self.reserve_inbound().await?.send(bytes);
        Ok(())
    }

    /// Wait for one free slot in the stdin queue.
    ///
    /// Holding the permit guarantees the following send does not wait, so a
    /// caller can race this against other events and only commit a message
    /// once the adapter has room for it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Write` once the process has exited or its stdin
    /// writer has stopped.
    pub async fn reserve_inbound(&self) -> Result<mpsc::Permit<'_, Bytes>> {
        if let Some(report) = self.exit_report() {
            return Err(AppError::Write(format!(
                "adapter process has exited: {}",
                report.reason
            )));
        }
        self.stdin_tx
            .reserve()
            .await
            .map_err(|_| AppError::Write("adapter stdin is closed".into()))
    }

    /// Take the stdout chunk stream. Ends when the process closes stdout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the stream was already taken.
    pub fn read_outbound(&mut self) -> Result<ReaderStream<ChildStdout>> {
        self.stdout
            .take()
            .map(ReaderStream::new)
            .ok_or_else(|| AppError::Io("adapter stdout already taken".into()))
    }

    /// Take the stderr chunk stream, for diagnostics only.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the stream was already taken.
    pub fn read_diagnostics(&mut self) -> Result<ReaderStream<ChildStderr>> {
        self.stderr
            .take()
            .map(ReaderStream::new)
            .ok_or_else(|| AppError::Io("adapter stderr already taken".into()))
    }

    /// Exit report if the process has already ended.
    #[must_use]
    pub fn exit_report(&self) -> Option<ExitReport> {
        Option::clone(&self.exit_rx.borrow())
    }

    /// Wait until the process ends, for whatever reason.
    pub async fn wait_for_exit(&self) -> ExitReport {
        let mut exit_rx = self.exit_rx.clone();
        let report = exit_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|seen| (*seen).clone());
        report.unwrap_or_else(ExitReport::lost)
    }

    /// Stop the process: termination signal, then a forced kill once the
    /// grace period lapses.
    ///
    /// Idempotent, and safe after the process has exited on its own; every
    /// call returns the same report.
    pub async fn terminate(&self) -> ExitReport {
        if self.exit_report().is_none() {
            debug!(session_id = %self.session_id, "adapter termination requested");
        }
        self.stop.cancel();
        self.wait_for_exit().await
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

/// Own `child` until it exits, then publish the report on `exit_tx`.
async fn supervise(
    session_id: String,
    mut child: Child,
    stop: CancellationToken,
    grace: Duration,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let report = tokio::select! {
        biased;

        status = child.wait() => ExitReport::from_wait(status, false, false),
        () = stop.cancelled() => shutdown_child(&session_id, &mut child, grace).await,
    };

    if report.is_unexpected() {
        warn!(session_id, exit_code = ?report.code, reason = %report.reason, "adapter process exited");
    } else {
        info!(
            session_id,
            exit_code = ?report.code,
            forced = report.forced,
            "adapter process stopped"
        );
    }

    exit_tx.send_replace(Some(report));
}

/// Signal `child` to exit, escalating to a kill after `grace`.
async fn shutdown_child(session_id: &str, child: &mut Child, grace: Duration) -> ExitReport {
    request_graceful_exit(session_id, child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => ExitReport::from_wait(status, true, false),
        Err(_elapsed) => {
            warn!(
                session_id,
                ?grace,
                "adapter did not exit within grace period, forcing kill"
            );
            if let Err(err) = child.kill().await {
                warn!(session_id, %err, "failed to force-kill adapter process");
            }
            ExitReport::from_wait(child.wait().await, true, true)
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(session_id: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(session_id, pid, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(session_id: &str, _child: &Child) {
    // Cancelling the writer already closed stdin, the only portable hint.
    debug!(session_id, "no termination signal on this platform; relying on stdin EOF");
}
