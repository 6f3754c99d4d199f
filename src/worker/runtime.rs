//! Worker process runtime

use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::adapter::{run_adapter, ConnectionTracker, HandoffListener, HANDOFF_QUEUE};
use crate::cluster::channel::{MasterChannel, WorkerMessage};
use crate::config::Config;
use crate::error::Result;
use crate::http;
use crate::shutdown::{DrainOutcome, Shutdown};

/// Per-worker settings passed by the master on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Pool slot
    pub ordinal: usize,

    /// Address for the direct listener
    pub bind_address: IpAddr,

    /// Direct listening port; no direct listener when unset
    pub port: Option<u16>,
}

/// Serve handed-off (and direct) connections until shutdown, then drain.
///
/// Sends `worker:ready` once the HTTP listener is in place and
/// `worker:draining` as soon as shutdown starts.
pub async fn run(
    options: WorkerOptions,
    channel: MasterChannel,
    shutdown: Shutdown,
) -> Result<DrainOutcome> {
    let direct = match options.port {
        Some(port) => {
            let listener = TcpListener::bind(SocketAddr::new(options.bind_address, port)).await?;
            tracing::info!(addr = %listener.local_addr()?, "App running on direct port");
            Some(listener)
        }
        None => None,
    };

    let channel = Arc::new(channel);
    let tracker = ConnectionTracker::new();
    let (handoff_tx, handoff_rx) = mpsc::channel(HANDOFF_QUEUE);
    let listener = HandoffListener::new(Some(handoff_rx), direct, tracker.clone());

    channel.send(WorkerMessage::Ready).await?;
    tracing::info!("Worker ready");

    shutdown.watch_task(
        "connection adapter",
        run_adapter(Arc::clone(&channel), handoff_tx, shutdown.clone()),
    );

    let announce = {
        let channel = Arc::clone(&channel);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            if let Err(e) = channel.send(WorkerMessage::Draining).await {
                tracing::debug!(error = %e, "Could not announce draining");
            }
        })
    };

    let server = http::serve(listener, http::build_app(), shutdown.clone());
    let outcome = shutdown.drain(server, || tracker.force_close_all()).await;

    // Shutdown has begun by now, so the announcement is already under way
    let _ = announce.await;
    Ok(outcome)
}

/// Entry point of the hidden `worker` subcommand
pub async fn run_process(
    config: Config,
    ordinal: usize,
    ipc_fd: RawFd,
    port: Option<u16>,
) -> ExitCode {
    let span = tracing::info_span!("worker", ordinal, pid = std::process::id());

    async move {
        let shutdown = Shutdown::from_config(&config.shutdown);
        shutdown.install_panic_hook();
        if let Err(e) = shutdown.install_signal_handlers() {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return ExitCode::FAILURE;
        }

        // SAFETY: the master created this descriptor for us and passed its
        // number on the command line; nothing else in this process owns it.
        let channel = match unsafe { MasterChannel::from_raw_fd(ipc_fd) } {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(ipc_fd, error = %e, "Invalid IPC descriptor");
                return ExitCode::FAILURE;
            }
        };

        let options = WorkerOptions {
            ordinal,
            bind_address: config.cluster.bind_address,
            port,
        };

        match run(options, channel, shutdown.clone()).await {
            Ok(outcome) => shutdown.finish(outcome),
            Err(e) => {
                tracing::error!(error = %e, category = e.category().label(), "Worker failed");
                ExitCode::FAILURE
            }
        }
    }
    .instrument(span)
    .await
}

/// Serve the app directly on `addr` without a master
pub async fn run_standalone(addr: SocketAddr, shutdown: Shutdown) -> Result<DrainOutcome> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "App running");

    let tracker = ConnectionTracker::new();
    let listener = HandoffListener::new(None, Some(listener), tracker.clone());
    let server = http::serve(listener, http::build_app(), shutdown.clone());

    Ok(shutdown.drain(server, || tracker.force_close_all()).await)
}
