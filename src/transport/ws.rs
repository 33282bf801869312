//! WebSocket listener that turns each upgraded connection into a session.
//!
//! The socket is split and adapted at the edge: the session only ever sees
//! a stream of text payloads and a sink of text payloads, so it can be
//! driven by in-memory channels in tests.

use std::fmt::Display;
use std::future::ready;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ListenerConfig, SessionConfig};
use crate::orchestrator::SessionManager;
use crate::session::BridgeProfile;
use crate::{AppError, Result};

/// Shared state for one listener's routes.
#[derive(Debug, Clone)]
struct ListenerState {
    profile: Arc<BridgeProfile>,
    manager: SessionManager,
}

/// A bound WebSocket endpoint for one adapter family.
#[derive(Debug)]
pub struct BridgeListener {
    profile: Arc<BridgeProfile>,
    path: String,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BridgeListener {
    /// Build the listener's profile and bind its socket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the adapter table is unusable and
    /// `AppError::Transport` if the address cannot be bound.
    pub async fn bind(config: &ListenerConfig, session: &SessionConfig) -> Result<Self> {
        let profile = Arc::new(BridgeProfile::from_config(config, session)?);
        let bind = config.socket_addr();
        let listener = TcpListener::bind(bind).await.map_err(|err| {
            AppError::Transport(format!(
                "listener '{}': failed to bind {bind}: {err}",
                config.name
            ))
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            listener = %config.name,
            %local_addr,
            path = %config.path,
            adapters = profile.registry.len(),
            "listener bound"
        );

        Ok(Self {
            profile,
            path: config.path.clone(),
            listener,
            local_addr,
        })
    }

    /// Address actually bound; differs from the configured one for port `0`.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Accept upgrades until `ct` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the HTTP server fails.
    pub async fn serve(self, manager: SessionManager, ct: CancellationToken) -> Result<()> {
        let name = self.profile.name.clone();
        let router = router(&self.path, Arc::clone(&self.profile), manager);

        let server = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { ct.cancelled().await });
        async move { server.await }
            .instrument(info_span!("listener", listener = %name))
            .await
            .map_err(|err| AppError::Transport(format!("listener '{name}' failed: {err}")))?;

        info!(listener = %name, "listener stopped");
        Ok(())
    }
}

/// Router accepting WebSocket upgrades on `path`.
#[must_use]
pub fn router(path: &str, profile: Arc<BridgeProfile>, manager: SessionManager) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .with_state(ListenerState { profile, manager })
}

#[allow(clippy::unused_async)] // axum handlers are async fns
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ListenerState) {
    if state.manager.is_shutting_down() {
        debug!(listener = %state.profile.name, "rejecting connection during shutdown");
        return;
    }

    let (ws_sender, ws_receiver) = socket.split();
    let handle = state
        .manager
        .open(
            Arc::clone(&state.profile),
            client_messages(ws_receiver),
            client_sink(ws_sender),
        )
        .await;

    match handle.task.await {
        Ok(reason) => debug!(session_id = %handle.id, %reason, "connection finished"),
        Err(err) => warn!(session_id = %handle.id, %err, "session task failed"),
    }
}

/// Client frames as text payloads.
///
/// Text passes through, binary must be UTF-8, control frames are skipped,
/// and a close frame ends the stream.
#[must_use]
pub fn client_messages<S>(frames: S) -> impl Stream<Item = Result<String>> + Unpin + Send
where
    S: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin + Send,
{
    frames
        .take_while(|frame| ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| ready(to_payload(frame)))
}

fn to_payload(frame: std::result::Result<Message, axum::Error>) -> Option<Result<String>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(Vec::from(bytes)) {
            Ok(text) => Some(Ok(text)),
            Err(err) => {
                warn!(%err, "dropping non-UTF-8 binary client message");
                None
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(err) => Some(Err(AppError::Transport(err.to_string()))),
    }
}

/// Text payloads to the client as WebSocket text frames.
#[must_use]
pub fn client_sink<W>(sink: W) -> impl Sink<String, Error = W::Error> + Unpin + Send
where
    W: Sink<Message> + Unpin + Send,
    W::Error: Display + Send,
{
    sink.with(|text: String| ready(Ok::<_, W::Error>(Message::Text(text.into()))))
}
