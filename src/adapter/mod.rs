//! Adapter process supervision.
//!
//! Each session owns at most one adapter process. The submodules split the
//! work the way the stdio pipes split it:
//! - `spawner`: launch, exit reporting, graceful-then-forced termination.
//! - `writer`: bounded, ordered writes to the adapter's stdin.
//! - `reader`: stdout frame pump and stderr diagnostics drain.

pub mod reader;
pub mod spawner;
pub mod writer;

pub use spawner::{AdapterProcess, ExitReport, ProcessSettings};
