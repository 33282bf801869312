//! Per-connection sessions.
//!
//! A session binds one client connection to at most one adapter process and
//! walks the lifecycle `Idle → Spawning → Active → Closing → Terminated`.

pub mod notice;
pub mod runner;
pub mod state;

pub use runner::{BridgeProfile, CloseReason, Session};
pub use state::{SessionState, StateCell};
