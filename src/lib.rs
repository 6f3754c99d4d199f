//! stickypool - sticky-session process pool for HTTP services
//!
//! A master process accepts TCP connections on one public port and hands each
//! one, unread, to a worker process picked from the client's IPv4 address, so
//! a given client keeps landing on the same worker while the pool is stable.
//! Workers that exit are replaced on the same slot.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`cluster`] - Master side: worker pool, registry, routing, IPC channel
//! - [`worker`] - Worker side: connection adapter and process runtime
//! - [`http`] - The HTTP application served by every worker
//! - [`shutdown`] - Per-process graceful shutdown coordinator
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stickypool::cluster::{Master, ProcessSpawner};
//! use stickypool::config::Config;
//! use stickypool::shutdown::Shutdown;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let shutdown = Shutdown::from_config(&config.shutdown);
//!     let master = Master::new(config, Arc::new(ProcessSpawner::current_exe()?));
//!     let listener = master.bind().await?;
//!     master.run(listener, shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod shutdown;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{
        Master, ProcessSpawner, RegistryReader, RoutingKey, Spawner, StickyRouter, WorkerPool,
        WorkerState,
    };
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::shutdown::{DrainOutcome, Shutdown, ShutdownTrigger};
}
