//! Worker-side connection adapter
//!
//! Connections arrive from two places: the master, over the IPC channel, and
//! (optionally) the worker's own direct listener. [`HandoffListener`] merges
//! both into one stream of accepted sockets for axum, so a handed-off
//! connection is served exactly like a locally accepted one. The master never
//! reads from a connection, so the first byte the HTTP server sees is the
//! first byte the client sent.
//!
//! Every connection is wrapped in a [`TrackedStream`] so the shutdown
//! coordinator can cut off whatever is still open at the drain deadline.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use nix::sys::socket::{shutdown as shutdown_socket, Shutdown as SocketShutdown};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::cluster::channel::{IpcError, MasterChannel};
use crate::shutdown::{Shutdown, ShutdownTrigger};

/// Pause after a failed direct accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Handed-off connections buffered between the adapter and the HTTP server
pub const HANDOFF_QUEUE: usize = 256;

// ============================================================================
// Connection Tracking
// ============================================================================

/// Set of open connections served by this process
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    open: Arc<Mutex<HashSet<RawFd>>>,
}

impl ConnectionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<RawFd>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a connection
    pub fn track(&self, stream: TcpStream) -> TrackedStream {
        let fd = stream.as_raw_fd();
        self.lock().insert(fd);
        TrackedStream {
            inner: stream,
            fd,
            tracker: self.clone(),
        }
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no connection is open
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Shut down both directions of every open connection. Returns how many
    /// connections were cut off.
    pub fn force_close_all(&self) -> usize {
        let open = self.lock();
        let mut closed = 0;
        for fd in open.iter() {
            // The set lock is held, so `fd` cannot have been closed and reused.
            match shutdown_socket(*fd, SocketShutdown::Both) {
                Ok(()) => closed += 1,
                Err(e) => tracing::debug!(fd, error = %e, "Failed to shut down connection"),
            }
        }
        closed
    }
}

/// A TCP stream registered with a [`ConnectionTracker`]
#[derive(Debug)]
pub struct TrackedStream {
    inner: TcpStream,
    fd: RawFd,
    tracker: ConnectionTracker,
}

impl TrackedStream {
    /// Remote address, if still connected
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        // Runs before `inner` closes the descriptor
        self.tracker.lock().remove(&self.fd);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

// ============================================================================
// Handoff Listener
// ============================================================================

/// axum listener fed by handed-off connections and an optional direct listener
#[derive(Debug)]
pub struct HandoffListener {
    handoffs: Option<mpsc::Receiver<TcpStream>>,
    direct: Option<TcpListener>,
    tracker: ConnectionTracker,
}

impl HandoffListener {
    /// Create a listener; either source may be absent
    pub fn new(
        handoffs: Option<mpsc::Receiver<TcpStream>>,
        direct: Option<TcpListener>,
        tracker: ConnectionTracker,
    ) -> Self {
        Self {
            handoffs,
            direct,
            tracker,
        }
    }

    async fn next_stream(&mut self) -> (TcpStream, SocketAddr) {
        loop {
            let next = {
                let handoffs = &mut self.handoffs;
                let direct = &self.direct;

                let handoff = async move {
                    match handoffs {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                };
                let accept = async move {
                    match direct {
                        Some(listener) => listener.accept().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    received = handoff => Incoming::Handoff(received),
                    accepted = accept => Incoming::Direct(accepted),
                }
            };

            match next {
                Incoming::Handoff(Some(stream)) => {
                    let peer = stream
                        .peer_addr()
                        .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                    return (stream, peer);
                }
                Incoming::Handoff(None) => {
                    tracing::debug!("Handoff queue closed");
                    self.handoffs = None;
                }
                Incoming::Direct(Ok(pair)) => return pair,
                Incoming::Direct(Err(e)) => {
                    tracing::warn!(error = %e, "Direct accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

enum Incoming {
    Handoff(Option<TcpStream>),
    Direct(io::Result<(TcpStream, SocketAddr)>),
}

impl axum::serve::Listener for HandoffListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, peer) = self.next_stream().await;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "Failed to set TCP_NODELAY");
        }
        tracing::trace!(%peer, "Connection accepted");
        (self.tracker.track(stream), peer)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        match &self.direct {
            Some(listener) => listener.local_addr(),
            None => Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
        }
    }
}

// ============================================================================
// Adapter Task
// ============================================================================

/// Receive connections from the master and queue them for the HTTP server.
///
/// Stops when shutdown starts (new handoffs are no longer taken) or when the
/// master closes the channel, in which case a shutdown is started.
pub async fn run_adapter(
    channel: Arc<MasterChannel>,
    handoffs: mpsc::Sender<TcpStream>,
    shutdown: Shutdown,
) -> Result<(), IpcError> {
    loop {
        let received = tokio::select! {
            _ = shutdown.wait() => break,
            received = channel.recv_connection() => received,
        };

        match received {
            Ok(Some(stream)) => {
                if handoffs.send(stream).await.is_err() {
                    tracing::debug!("HTTP server is gone; dropping handed-off connection");
                    break;
                }
            }
            Ok(None) => {
                tracing::warn!("Master channel closed");
                shutdown.begin(ShutdownTrigger::MasterGone);
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "Discarding malformed handoff");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
