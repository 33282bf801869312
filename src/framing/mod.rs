//! Wire framing between the bridge and adapter processes.
//!
//! - `codec`: `Content-Length` style header framing over stdio byte streams.

pub mod codec;

pub use codec::{Frame, FrameCodec, FrameError};
