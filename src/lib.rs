#![forbid(unsafe_code)]

//! Stream-multiplexing bridge between WebSocket clients and stdio adapters.

pub mod adapter;
pub mod config;
pub mod errors;
pub mod framing;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
