//! Session registry and lifecycle coordination across listeners.
//!
//! Every accepted client connection becomes a [`Session`] running on its
//! own task. The manager only tracks identity, listener, and an observable
//! state per session; all per-session resources live inside the task so a
//! failure in one session never reaches another.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, Sink, Stream};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::session::{BridgeProfile, CloseReason, Session, SessionState};
use crate::Result;

/// Bookkeeping for one live session.
#[derive(Debug)]
struct TrackedSession {
    listener: String,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Listener that accepted the connection.
    pub listener: String,
    /// State at the time of the snapshot.
    pub state: SessionState,
}

/// Handle returned when a session is opened.
#[derive(Debug)]
pub struct SessionHandle {
    /// Session identifier.
    pub id: String,
    /// Observes every state transition.
    pub state: watch::Receiver<SessionState>,
    /// Resolves with the close reason once the session is `Terminated`.
    pub task: JoinHandle<CloseReason>,
}

#[derive(Debug)]
struct Inner {
    sessions: Mutex<HashMap<String, TrackedSession>>,
    root: CancellationToken,
}

/// Owns the set of live sessions; cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager whose sessions all stop when `root` is cancelled.
    #[must_use]
    pub fn new(root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                root,
            }),
        }
    }

    /// Start a session for one client connection.
    ///
    /// The session runs on its own task and unregisters itself when it
    /// reaches `Terminated` or its task panics.
    pub async fn open<R, W>(
        &self,
        profile: Arc<BridgeProfile>,
        inbound: R,
        outbound: W,
    ) -> SessionHandle
    where
        R: Stream<Item = Result<String>> + Unpin + Send + 'static,
        W: Sink<String> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let id = Uuid::new_v4().to_string();
        let cancel = self.inner.root.child_token();
        let listener = profile.name.clone();
        let session = Session::new(id.clone(), profile, cancel.clone());
        let state = session.subscribe();

        self.inner.sessions.lock().await.insert(
            id.clone(),
            TrackedSession {
                listener: listener.clone(),
                state: state.clone(),
                cancel,
            },
        );
        info!(session_id = %id, listener = %listener, "session registered");

        let manager = self.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(session.run(inbound, outbound))
                .catch_unwind()
                .await;
            manager.inner.sessions.lock().await.remove(&task_id);
            match outcome {
                Ok(reason) => reason,
                Err(panic) => {
                    warn!(session_id = %task_id, "session task panicked");
                    std::panic::resume_unwind(panic)
                }
            }
        });

        SessionHandle { id, state, task }
    }

    /// Cancel one session. Returns `false` if no such session is live.
    pub async fn close(&self, id: &str) -> bool {
        let sessions = self.inner.sessions.lock().await;
        let Some(tracked) = sessions.get(id) else {
            return false;
        };
        tracked.cancel.cancel();
        true
    }

    /// States of all live sessions.
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.lock().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, tracked)| SessionSummary {
                id: id.clone(),
                listener: tracked.listener.clone(),
                state: *tracked.state.borrow(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.lock().await.is_empty()
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Cancel every session and wait up to `timeout` for each to reach
    /// `Terminated`.
    ///
    /// Returns the number of sessions still tearing down when the wait
    /// ended; their adapters are killed when the runtime drops them.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.inner.root.cancel();

        let receivers: Vec<watch::Receiver<SessionState>> = self
            .inner
            .sessions
            .lock()
            .await
            .values()
            .map(|tracked| tracked.state.clone())
            .collect();
        info!(sessions = receivers.len(), "shutting down sessions");

        let waiting = receivers.clone();
        let all_closed = async move {
            for mut rx in waiting {
                // A dropped sender means the session task already finished.
                drop(rx.wait_for(|state| state.is_terminal()).await);
            }
        };

        if tokio::time::timeout(timeout, all_closed).await.is_err() {
            let remaining = receivers
                .iter()
                .filter(|rx| !rx.borrow().is_terminal())
                .count();
            warn!(remaining, ?timeout, "sessions still closing after shutdown timeout");
            return remaining;
        }

        info!("all sessions terminated");
        0
    }
}
