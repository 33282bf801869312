//! Client-facing transports.

pub mod ws;

pub use ws::BridgeListener;
