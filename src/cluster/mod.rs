//! Master side of the process pool
//!
//! The master accepts client connections on the public port and hands each
//! one, unread, to a worker process chosen from the client's address. It also
//! keeps the pool at its configured size by replacing workers that exit.
//!
//! # Components
//!
//! - [`pool::WorkerPool`]: spawns and supervises workers, owns the registry
//! - [`router::StickyRouter`]: accepts and routes connections
//! - [`channel`]: the master/worker IPC channel and descriptor passing
//! - [`admin`]: optional health/worker/metrics endpoints
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stickypool::cluster::{Master, ProcessSpawner};
//! use stickypool::shutdown::Shutdown;
//!
//! let config = stickypool::config::Config::from_env()?;
//! let shutdown = Shutdown::from_config(&config.shutdown);
//! let master = Master::new(config, Arc::new(ProcessSpawner::current_exe()?));
//! let listener = master.bind().await?;
//! let outcome = master.run(listener, shutdown).await?;
//! ```

pub mod admin;
pub mod channel;
pub mod exit;
pub mod handle;
pub mod master;
pub mod pool;
pub mod registry;
pub mod router;
pub mod routing;
pub mod spawn;

pub use channel::{
    IpcError, MasterChannel, TransferError, TransferableConnection, WorkerChannel, WorkerMessage,
};
pub use exit::TerminationReason;
pub use handle::{WorkerHandle, WorkerInfo, WorkerState};
pub use master::Master;
pub use pool::{PoolEvent, WorkerPool};
pub use registry::{RegistryReader, RegistryStats, WorkerRegistry};
pub use router::{RouteOutcome, StickyRouter};
pub use routing::RoutingKey;
pub use spawn::{ProcessSpawner, SpawnedWorker, Spawner, WorkerSpec};
