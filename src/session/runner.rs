//! Session run loop: one client connection bound to at most one adapter.
//!
//! The loop is straight-line per state:
//! 1. `Idle`: Wait for the first well-formed client message and read the
//!    capability identifier from it.
//! 2. `Spawning`: Resolve the descriptor and launch the adapter while
//!    queueing any client messages that arrive in the meantime.
//! 3. `Active`: Relay client messages to stdin as frames and frame bodies
//!    from stdout to the client, until either side ends.
//! 4. `Closing` / `Terminated`: One teardown routine for every exit path.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::IgnoredAny;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::notice;
use super::state::{SessionState, StateCell};
use crate::adapter::reader::{drain_diagnostics, run_outbound_pump, DiagnosticTail, PumpEnd};
use crate::adapter::{AdapterProcess, ExitReport, ProcessSettings};
use crate::config::{FramingConfig, ListenerConfig, SessionConfig};
use crate::framing::{Frame, FrameCodec};
use crate::registry::{extract_capability, AdapterDescriptor, AdapterRegistry};
use crate::Result;

/// Frames decoded ahead of delivery to the client.
const FRAME_QUEUE_CAPACITY: usize = 64;

/// How long frames already written by an exiting adapter are still delivered.
const EXIT_FLUSH_WINDOW: Duration = Duration::from_millis(500);

/// How long teardown waits for the stderr drain to reach EOF.
const DIAGNOSTIC_WINDOW: Duration = Duration::from_millis(500);

// ── Profile ──────────────────────────────────────────────────────────────────

/// Everything a session needs from its listener; shared read-only.
#[derive(Debug)]
pub struct BridgeProfile {
    /// Listener name used in logs.
    pub name: String,
    /// Capability table for this listener.
    pub registry: AdapterRegistry,
    /// JSON pointer to the capability identifier.
    pub capability_pointer: String,
    /// Whether the capability-declaring message is forwarded to the adapter.
    pub forward_first_message: bool,
    /// Adapter wire framing.
    pub framing: FramingConfig,
    /// Session limits.
    pub session: SessionConfig,
}

impl BridgeProfile {
    /// Build the profile for one configured listener.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the adapter table has no default entry.
    pub fn from_config(listener: &ListenerConfig, session: &SessionConfig) -> Result<Self> {
        Ok(Self {
            name: listener.name.clone(),
            registry: AdapterRegistry::from_entries(&listener.adapters)?,
            capability_pointer: listener.capability_pointer.clone(),
            forward_first_message: listener.forward_first_message,
            framing: listener.framing.clone(),
            session: session.clone(),
        })
    }
}

// ── Close reason ─────────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed its connection.
    ClientDisconnected,
    /// The client transport failed while reading or writing.
    TransportFailed(String),
    /// The adapter could not be launched.
    SpawnFailed(String),
    /// The adapter process ended.
    ProcessExited(ExitReport),
    /// The adapter closed stdout but kept running.
    OutputClosed,
    /// Adapter output could not be framed.
    FramingFailed(String),
    /// A write to the adapter's stdin failed.
    WriteFailed(String),
    /// The session was cancelled from outside (bridge shutdown).
    Cancelled,
}

impl CloseReason {
    /// Whether the client side ended the session.
    #[must_use]
    pub const fn is_client_side(&self) -> bool {
        matches!(self, Self::ClientDisconnected | Self::TransportFailed(_))
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::TransportFailed(msg) => write!(f, "transport failed: {msg}"),
            Self::SpawnFailed(msg) => write!(f, "spawn failed: {msg}"),
            Self::ProcessExited(report) => write!(f, "adapter exited: {}", report.reason),
            Self::OutputClosed => write!(f, "adapter closed stdout"),
            Self::FramingFailed(msg) => write!(f, "framing failed: {msg}"),
            Self::WriteFailed(msg) => write!(f, "adapter write failed: {msg}"),
            Self::Cancelled => write!(f, "session cancelled"),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Resources owned while an adapter is running.
struct ActiveAdapter {
    process: AdapterProcess,
    encoder: FrameCodec,
    pending: VecDeque<String>,
    frames: mpsc::Receiver<Frame>,
    pump: Option<JoinHandle<PumpEnd>>,
    diagnostics: JoinHandle<DiagnosticTail>,
    io_cancel: CancellationToken,
}

/// First client message, kept both raw and parsed.
struct FirstMessage {
    raw: String,
    value: serde_json::Value,
}

/// One client connection and, once requested, its adapter process.
#[derive(Debug)]
pub struct Session {
    id: String,
    profile: Arc<BridgeProfile>,
    state: StateCell,
    cancel: CancellationToken,
}

impl Session {
    /// New session in `Idle`; `cancel` aborts it from outside.
    #[must_use]
    pub fn new(id: String, profile: Arc<BridgeProfile>, cancel: CancellationToken) -> Self {
        Self {
            id,
            profile,
            state: StateCell::new(),
            cancel,
        }
    }

    /// Opaque session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session to `Terminated` and report why it ended.
    ///
    /// `inbound` yields client messages and ends when the client disconnects;
    /// `outbound` carries messages to the client and is closed on teardown.
    pub async fn run<R, W>(self, mut inbound: R, mut outbound: W) -> CloseReason
    where
        R: Stream<Item = Result<String>> + Unpin + Send,
        W: Sink<String> + Unpin + Send,
        W::Error: Display,
    {
        let span = info_span!("session", session_id = %self.id, listener = %self.profile.name);
        async move {
            info!("session opened");
            let (reason, adapter) = match self.open_adapter(&mut inbound, &mut outbound).await {
                Ok(mut adapter) => {
                    let reason = self.forward(&mut adapter, &mut inbound, &mut outbound).await;
                    (reason, Some(adapter))
                }
                Err(reason) => (reason, None),
            };
            self.teardown(&mut outbound, adapter, &reason).await;
            reason
        }
        .instrument(span)
        .await
    }

    /// `Idle` and `Spawning`: wait for a capability, then launch the adapter.
    async fn open_adapter<R, W>(
        &self,
        inbound: &mut R,
        outbound: &mut W,
    ) -> std::result::Result<ActiveAdapter, CloseReason>
    where
        R: Stream<Item = Result<String>> + Unpin + Send,
        W: Sink<String> + Unpin + Send,
        W::Error: Display,
    {
        let first = self.await_first_message(inbound).await?;
        let capability = extract_capability(&first.value, &self.profile.capability_pointer);

        self.state.advance(&self.id, SessionState::Spawning);
        let resolution = self.profile.registry.resolve(capability.as_deref());
        let descriptor = resolution.descriptor.clone();
        info!(
            session_id = %self.id,
            requested = capability.as_deref().unwrap_or("<none>"),
            capability = %descriptor.capability_id,
            fallback = resolution.fallback,
            "spawning adapter"
        );

        let mut pending = VecDeque::new();
        if self.profile.forward_first_message {
            pending.push_back(first.raw);
        }

        let spawned = self.spawn_while_queueing(&descriptor, inbound, &mut pending).await?;
        let mut process = match spawned {
            Ok(process) => process,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "adapter spawn failed");
                let message = err.to_string();
                let failure =
                    notice::spawn_failed(first.value.get("id"), &descriptor.capability_id, &message);
                if let Err(send_err) = outbound.send(failure).await {
                    debug!(session_id = %self.id, error = %send_err, "could not report spawn failure");
                }
                return Err(CloseReason::SpawnFailed(message));
            }
        };

        let stdout = process
            .read_outbound()
            .map_err(|err| CloseReason::SpawnFailed(err.to_string()))?;
        let stderr = process
            .read_diagnostics()
            .map_err(|err| CloseReason::SpawnFailed(err.to_string()))?;

        let io_cancel = self.cancel.child_token();
        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let pump = tokio::spawn(run_outbound_pump(
            self.id.clone(),
            stdout,
            FrameCodec::from_config(&self.profile.framing),
            frame_tx,
            io_cancel.clone(),
        ));
        let diagnostics = tokio::spawn(drain_diagnostics(
            self.id.clone(),
            stderr,
            self.profile.session.stderr_tail_bytes,
            io_cancel.clone(),
        ));

        self.state.advance(&self.id, SessionState::Active);
        Ok(ActiveAdapter {
            process,
            encoder: FrameCodec::from_config(&self.profile.framing),
            pending,
            frames,
            pump: Some(pump),
            diagnostics,
            io_cancel,
        })
    }

    /// `Active`: relay both directions until either side ends.
    ///
    /// Client messages join `pending` and are committed to stdin only once
    /// the writer queue has room, so a stalled adapter never stops the loop
    /// from seeing cancellation, process exit or a client disconnect.
    async fn forward<R, W>(
        &self,
        adapter: &mut ActiveAdapter,
        inbound: &mut R,
        outbound: &mut W,
    ) -> CloseReason
    where
        R: Stream<Item = Result<String>> + Unpin + Send,
        W: Sink<String> + Unpin + Send,
        W::Error: Display,
    {
        let limit = self.profile.session.max_pending_messages;
        loop {
            // Steps needing `&mut adapter` run after the `select!`, once the
            // borrow held by the stdin permit branch has ended.
            let finished: Option<Option<ExitReport>> = tokio::select! {
                biased;

                () = self.cancel.cancelled() => return CloseReason::Cancelled,

                frame = adapter.frames.recv() => match frame {
                    // A client that stops reading must not outlive cancellation.
                    Some(frame) => tokio::select! {
                        biased;

                        () = self.cancel.cancelled() => return CloseReason::Cancelled,
                        sent = self.deliver(outbound, &frame) => {
                            if let Err(reason) = sent {
                                return reason;
                            }
                            None
                        }
                    },
                    None => Some(None),
                },

                report = adapter.process.wait_for_exit() => Some(Some(report)),

                permit = adapter.process.reserve_inbound(), if !adapter.pending.is_empty() => {
                    let permit = match permit {
                        Ok(permit) => permit,
                        Err(err) => return CloseReason::WriteFailed(err.to_string()),
                    };
                    if let Some(text) = adapter.pending.pop_front() {
                        permit.send(adapter.encoder.encode(text.as_bytes()));
                    }
                    None
                }

                msg = inbound.next() => match msg {
                    None => return CloseReason::ClientDisconnected,
                    Some(Err(err)) => return CloseReason::TransportFailed(err.to_string()),
                    Some(Ok(text)) => {
                        if !is_well_formed(&self.id, &text) {
                            continue;
                        }
                        if adapter.pending.len() >= limit {
                            warn!(
                                session_id = %self.id,
                                limit,
                                "adapter is not draining stdin, closing session"
                            );
                            return CloseReason::WriteFailed(format!(
                                "adapter stdin backlog exceeded {limit} messages"
                            ));
                        }
                        adapter.pending.push_back(text);
                        None
                    }
                },
            };

            match finished {
                None => {}
                Some(None) => return self.pump_finished(adapter).await,
                Some(Some(report)) => {
                    self.flush_after_exit(adapter, outbound).await;
                    return CloseReason::ProcessExited(report);
                }
            }
        }
    }

    /// `Closing` → `Terminated`: the single teardown routine.
    async fn teardown<W>(&self, outbound: &mut W, adapter: Option<ActiveAdapter>, reason: &CloseReason)
    where
        W: Sink<String> + Unpin + Send,
        W::Error: Display,
    {
        if adapter.is_some() || matches!(reason, CloseReason::SpawnFailed(_)) {
            self.state.advance(&self.id, SessionState::Closing);
        }

        if let Some(mut adapter) = adapter {
            let report = adapter.process.terminate().await;

            let mut tail = tokio::time::timeout(DIAGNOSTIC_WINDOW, &mut adapter.diagnostics)
                .await
                .ok()
                .and_then(std::result::Result::ok);
            adapter.io_cancel.cancel();
            if tail.is_none() && !adapter.diagnostics.is_finished() {
                tail = (&mut adapter.diagnostics).await.ok();
            }
            if let Some(pump) = adapter.pump.take() {
                pump.abort();
            }

            if report.is_unexpected() && !reason.is_client_side() {
                let stderr = tail.as_ref().map_or_else(String::new, DiagnosticTail::text);
                let exited = notice::adapter_exited(&report, &stderr);
                if let Err(err) = outbound.send(exited).await {
                    debug!(session_id = %self.id, error = %err, "could not report adapter exit");
                }
            }
        }

        if let Err(err) = outbound.close().await {
            debug!(session_id = %self.id, error = %err, "client transport already closed");
        }
        self.state.advance(&self.id, SessionState::Terminated);
        info!(session_id = %self.id, reason = %reason, "session closed");
    }

    /// Launch the adapter, queueing client messages until it is up.
    async fn spawn_while_queueing<R>(
        &self,
        descriptor: &AdapterDescriptor,
        inbound: &mut R,
        pending: &mut VecDeque<String>,
    ) -> std::result::Result<Result<AdapterProcess>, CloseReason>
    where
        R: Stream<Item = Result<String>> + Unpin + Send,
    {
        let settings = ProcessSettings::from(&self.profile.session);
        let spawn = AdapterProcess::spawn(&self.id, descriptor, settings);
        tokio::pin!(spawn);
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
                result = &mut spawn => return Ok(result),
                msg = inbound.next() => match msg {
                    Some(Ok(text)) => self.queue_pending(pending, text),
                    Some(Err(err)) => return Err(CloseReason::TransportFailed(err.to_string())),
                    None => return Err(CloseReason::ClientDisconnected),
                },
            }
        }
    }

    async fn await_first_message<R>(
        &self,
        inbound: &mut R,
    ) -> std::result::Result<FirstMessage, CloseReason>
    where
        R: Stream<Item = Result<String>> + Unpin + Send,
    {
        loop {
            let msg = tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
                msg = inbound.next() => msg,
            };

            match msg {
                None => return Err(CloseReason::ClientDisconnected),
                Some(Err(err)) => return Err(CloseReason::TransportFailed(err.to_string())),
                Some(Ok(raw)) => match serde_json::from_str(&raw) {
                    Ok(value) => return Ok(FirstMessage { raw, value }),
                    Err(err) => {
                        warn!(session_id = %self.id, error = %err, "dropping malformed client payload");
                    }
                },
            }
        }
    }

    fn queue_pending(&self, pending: &mut VecDeque<String>, text: String) {
        if !is_well_formed(&self.id, &text) {
            return;
        }
        if pending.len() >= self.profile.session.max_pending_messages {
            warn!(
                session_id = %self.id,
                limit = self.profile.session.max_pending_messages,
                "pending queue full while spawning, dropping client message"
            );
            return;
        }
        pending.push_back(text);
    }

    /// Send one frame body to the client as a text message.
    async fn deliver<W>(&self, outbound: &mut W, frame: &Frame) -> std::result::Result<(), CloseReason>
    where
        W: Sink<String> + Unpin + Send,
        W::Error: Display,
    {
        let Some(text) = frame.body_str() else {
            warn!(
                session_id = %self.id,
                bytes = frame.body.len(),
                "dropping frame with non-UTF-8 body"
            );
            return Ok(());
        };
        outbound
            .send(text.to_owned())
            .await
            .map_err(|err| CloseReason::TransportFailed(format!("client send failed: {err}")))
    }

    /// The stdout pump stopped on its own; translate why.
    async fn pump_finished(&self, adapter: &mut ActiveAdapter) -> CloseReason {
        let Some(pump) = adapter.pump.take() else {
            return CloseReason::OutputClosed;
        };
        match pump.await {
            Ok(PumpEnd::Eof) => {
                let grace = self.profile.session.grace_period();
                match tokio::time::timeout(grace, adapter.process.wait_for_exit()).await {
                    Ok(report) => CloseReason::ProcessExited(report),
                    Err(_elapsed) => CloseReason::OutputClosed,
                }
            }
            Ok(PumpEnd::Fatal(err)) => CloseReason::FramingFailed(err.to_string()),
            Ok(PumpEnd::Cancelled | PumpEnd::ReceiverClosed) => CloseReason::Cancelled,
            Err(err) => CloseReason::FramingFailed(format!("outbound pump failed: {err}")),
        }
    }

    /// Deliver frames the adapter wrote before exiting, for a bounded window.
    async fn flush_after_exit<W>(&self, adapter: &mut ActiveAdapter, outbound: &mut W)
    where
        W: Sink<String> + Unpin + Send,
        W::Error: Display,
    {
        let window = tokio::time::sleep(EXIT_FLUSH_WINDOW);
        tokio::pin!(window);
        loop {
            tokio::select! {
                () = &mut window => break,
                frame = adapter.frames.recv() => match frame {
                    Some(frame) => {
                        if self.deliver(outbound, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }
}

/// Frame `text` and queue it for the adapter's stdin.
/// Client payloads must be JSON; anything else is logged and dropped.
fn is_well_formed(session_id: &str, text: &str) -> bool {
    match serde_json::from_str::<IgnoredAny>(text) {
        Ok(_) => true,
        Err(err) => {
            warn!(session_id, error = %err, "dropping malformed client payload");
            false
        }
    }
}
