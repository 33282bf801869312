//! Session lifecycle states and their transition table.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle state of one client session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport connected, no adapter yet.
    Idle,
    /// Capability identified, adapter launch in progress.
    Spawning,
    /// Adapter running, forwarding in both directions.
    Active,
    /// Teardown initiated from either side.
    Closing,
    /// Final; every resource has been released.
    Terminated,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Spawning | Self::Terminated)
                | (Self::Spawning, Self::Active | Self::Closing | Self::Terminated)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Terminated)
        )
    }

    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Lower-case name used in logs and snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes a session's state to any number of observers.
///
/// Rejected transitions are ignored, so repeated shutdown triggers collapse
/// into the single teardown already under way.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    /// New cell in [`SessionState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self { tx }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every subsequent transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// Returns `true` when the state changed.
    pub fn advance(&self, session_id: &str, next: SessionState) -> bool {
        let current = self.get();
        if !current.can_transition_to(next) {
            debug!(session_id, from = %current, to = %next, "ignoring session transition");
            return false;
        }
        self.tx.send_replace(next);
        info!(session_id, from = %current, to = %next, "session state changed");
        true
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
