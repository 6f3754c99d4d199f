//! Master process
//!
//! Wires the pool, the router and the optional admin API together and runs
//! them until the shutdown coordinator fires.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;

use super::admin::{self, AdminState};
use super::pool::WorkerPool;
use super::router::StickyRouter;
use super::spawn::Spawner;
use crate::config::Config;
use crate::error::Result;
use crate::shutdown::{DrainOutcome, Shutdown};

/// The master process: public listener plus worker supervision
pub struct Master {
    config: Config,
    spawner: Arc<dyn Spawner>,
}

impl Master {
    /// Create a master with the given spawner
    pub fn new(config: Config, spawner: Arc<dyn Spawner>) -> Self {
        Self { config, spawner }
    }

    /// Bind the public listener
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.cluster.public_address();
        Ok(TcpListener::bind(addr).await?)
    }

    /// Start the workers and serve until shutdown.
    ///
    /// Returns how the workers were stopped. A failure to start the initial
    /// workers is returned as an error after the ones already started are
    /// stopped.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<DrainOutcome> {
        let workers = self.config.cluster.workers;
        tracing::info!(pid = std::process::id(), workers, "Master is running");

        let mut pool = WorkerPool::new(self.config.cluster.clone(), self.spawner);
        if let Err(e) = pool.spawn(workers).await {
            tracing::error!(error = %e, category = e.category().label(), "Failed to start workers");
            pool.shutdown_workers(shutdown.drain_timeout()).await;
            return Err(e);
        }

        let router = StickyRouter::new(pool.reader());
        let router_task = shutdown.watch_task("router", router.run(listener, shutdown.clone()));

        let admin_task = self.config.admin.bind_address.map(|addr| {
            let state = AdminState {
                registry: pool.reader(),
                expected_workers: workers,
                start_time: Instant::now(),
            };
            shutdown.watch_task("admin", admin::serve(addr, state, shutdown.clone()))
        });

        let outcome = pool.run(shutdown.clone()).await;

        let _ = router_task.await;
        if let Some(task) = admin_task {
            let _ = task.await;
        }

        tracing::info!(?outcome, "Master stopped");
        Ok(outcome)
    }
}
