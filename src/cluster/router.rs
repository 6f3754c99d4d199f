//! Sticky session router
//!
//! The master's public listener. Connections are accepted and handed off
//! before a single byte is read from them; the worker that reads the request
//! is chosen from the client address alone.

use std::time::Duration;

use tokio::net::TcpListener;

use super::channel::{TransferError, TransferableConnection};
use super::registry::RegistryReader;
use super::routing::RoutingKey;
use crate::error::Result;
use crate::metrics;
use crate::shutdown::Shutdown;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What happened to one inbound connection
#[derive(Debug)]
pub enum RouteOutcome {
    /// Handed to a worker
    Transferred { pid: u32, ordinal: usize },

    /// No worker was ready; the connection was closed
    NoReadyWorker,

    /// The handoff failed; the connection was closed
    TransferFailed {
        pid: u32,
        ordinal: usize,
        error: TransferError,
    },
}

impl RouteOutcome {
    /// Check if the connection reached a worker
    pub fn is_transferred(&self) -> bool {
        matches!(self, Self::Transferred { .. })
    }
}

/// Routes accepted connections to ready workers
#[derive(Debug, Clone)]
pub struct StickyRouter {
    registry: RegistryReader,
}

impl StickyRouter {
    /// Create a router over a read-only registry view
    pub fn new(registry: RegistryReader) -> Self {
        Self { registry }
    }

    /// Route one connection. The connection is consumed either way.
    pub async fn route(&self, conn: TransferableConnection) -> RouteOutcome {
        let peer = conn.peer_addr();
        let key = RoutingKey::from_ip(peer.ip());

        let ready = self.registry.ready_snapshot().await;
        let Some(index) = key.select_index(ready.len()) else {
            tracing::error!(%peer, "No workers available!");
            metrics::record_connection_rejected("no_ready_worker");
            drop(conn);
            return RouteOutcome::NoReadyWorker;
        };

        let worker = &ready[index];
        let (pid, ordinal) = (worker.pid, worker.ordinal);

        match worker.channel.send_connection(conn).await {
            Ok(()) => {
                tracing::debug!(%peer, key = key.value(), pid, ordinal, "Connection handed off");
                metrics::record_connection_routed(ordinal);
                RouteOutcome::Transferred { pid, ordinal }
            }
            Err(error) => {
                tracing::error!(%peer, pid, ordinal, %error, "Failed to hand off connection");
                metrics::record_connection_rejected("transfer_failed");
                RouteOutcome::TransferFailed {
                    pid,
                    ordinal,
                    error,
                }
            }
        }
    }

    /// Accept and route connections until shutdown starts
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(%local, "Master TCP server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let router = self.clone();
                    tokio::spawn(async move {
                        router
                            .route(TransferableConnection::new(stream, peer))
                            .await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        tracing::info!(%local, "Master listener closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::channel::{MasterChannel, WorkerChannel};
    use crate::cluster::handle::WorkerHandle;
    use crate::cluster::registry::WorkerRegistry;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpStream, UnixStream};

    async fn accepted() -> (TcpStream, TransferableConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, TransferableConnection::new(server, peer))
    }

    #[tokio::test]
    async fn test_empty_ready_set_closes_connection() {
        let registry = WorkerRegistry::new();
        let router = StickyRouter::new(registry.reader());

        let (mut client, conn) = accepted().await;
        let outcome = router.route(conn).await;
        assert!(matches!(outcome, RouteOutcome::NoReadyWorker));

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_loopback_routes_by_key() {
        let registry = WorkerRegistry::new();
        let mut workers = Vec::new();
        for (pid, ordinal) in [(10, 0), (11, 1), (12, 2)] {
            let (master_end, worker_end) = UnixStream::pair().unwrap();
            registry
                .insert(WorkerHandle::new(pid, ordinal, None, WorkerChannel::new(master_end)))
                .await;
            registry.update(pid, |h| h.mark_ready()).await;
            workers.push(MasterChannel::new(worker_end));
        }
        let router = StickyRouter::new(registry.reader());

        // 127.0.0.1 sums to 128; 128 % 3 == 2
        let (_client, conn) = accepted().await;
        let outcome = router.route(conn).await;
        assert!(matches!(outcome, RouteOutcome::Transferred { pid: 12, ordinal: 2 }));
        assert!(workers[2].recv_connection().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_channel_fails_transfer() {
        let registry = WorkerRegistry::new();
        let (master_end, worker_end) = UnixStream::pair().unwrap();
        registry
            .insert(WorkerHandle::new(7, 0, None, WorkerChannel::new(master_end)))
            .await;
        registry.update(7, |h| h.mark_ready()).await;
        drop(worker_end);

        let router = StickyRouter::new(registry.reader());
        let (_client, conn) = accepted().await;
        let outcome = router.route(conn).await;
        assert!(matches!(
            outcome,
            RouteOutcome::TransferFailed {
                pid: 7,
                error: TransferError::ChannelClosed,
                ..
            }
        ));
    }
}
