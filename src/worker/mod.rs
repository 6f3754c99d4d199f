//! Worker side of the process pool
//!
//! A worker is the same binary started with the hidden `worker` subcommand.
//! It serves the HTTP application on connections handed over by the master
//! (and on its own direct port when one is assigned), reports readiness over
//! the IPC channel, and drains on its own shutdown coordinator.

pub mod adapter;
pub mod runtime;

pub use adapter::{ConnectionTracker, HandoffListener, TrackedStream};
pub use runtime::{run, run_process, run_standalone, WorkerOptions};
