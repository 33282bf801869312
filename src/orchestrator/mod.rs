//! Session orchestration.
//!
//! Tracks live sessions across listeners and coordinates shutdown.

pub mod session_manager;

pub use session_manager::{SessionHandle, SessionManager, SessionSummary};
