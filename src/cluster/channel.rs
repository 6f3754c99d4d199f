//! Master/worker IPC channel.
//!
//! Each worker is connected to the master by one Unix stream socket pair.
//! Two message shapes travel over it:
//!
//! - worker → master: newline-terminated tokens ([`WorkerMessage`]).
//! - master → worker: the fixed-size [`TRANSFER_TAG`] frame with exactly one
//!   TCP socket descriptor attached as `SCM_RIGHTS` ancillary data.
//!
//! The transfer frame has a fixed length so the receiver can ask `recvmsg` for
//! exactly one frame and never picks up the descriptors of the next one.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

/// Readiness token sent once the worker's HTTP listener is bound.
pub const READY_TOKEN: &str = "worker:ready";

/// Token sent when the worker starts its own graceful shutdown.
pub const DRAINING_TOKEN: &str = "worker:draining";

/// Sentinel marking a frame as a transferred connection.
pub const TRANSFER_TAG: &[u8; 26] = b"sticky-session:connection\n";

/// Longest worker → master line accepted before the channel is considered corrupt.
const MAX_LINE_LEN: usize = 4096;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Message from worker to master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// The worker can accept forwarded connections.
    Ready,
    /// The worker stopped accepting and is draining.
    Draining,
}

impl WorkerMessage {
    /// Wire token for this message.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Ready => READY_TOKEN,
            Self::Draining => DRAINING_TOKEN,
        }
    }

    /// Serialize to a line (with newline).
    pub fn to_line(&self) -> String {
        format!("{}\n", self.token())
    }

    /// Parse a line; unknown tokens yield `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        match line.trim() {
            READY_TOKEN => Some(Self::Ready),
            DRAINING_TOKEN => Some(Self::Draining),
            _ => None,
        }
    }
}

/// Channel errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Underlying socket failed
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A frame did not match the transfer sentinel
    #[error("unexpected frame of {len} bytes")]
    UnexpectedFrame { len: usize },

    /// A transfer frame arrived without a socket descriptor
    #[error("transfer frame carried no descriptor")]
    MissingDescriptor,

    /// A worker line grew past the limit without a newline
    #[error("message exceeds {max} bytes without a newline")]
    Oversized { max: usize },
}

impl IpcError {
    /// Whether the channel is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        // A frame without a descriptor still consumed exactly one frame, so the
        // stream stays aligned. Everything else leaves it in an unknown state.
        matches!(self, Self::MissingDescriptor)
    }
}

/// Connection handoff errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// The worker end of the channel is gone
    #[error("worker channel is closed")]
    ChannelClosed,

    /// The kernel accepted only part of the frame
    #[error("partial transfer frame: wrote {written} of {expected} bytes")]
    Incomplete { written: usize, expected: usize },

    /// Any other socket failure
    #[error("transfer failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => Self::ChannelClosed,
            _ => Self::Io(err),
        }
    }
}

/// A client connection accepted by the master and not yet read from.
///
/// The value is consumed by [`WorkerChannel::send_connection`]; the master's
/// copy of the socket is closed as soon as the send returns, whether or not it
/// succeeded.
#[derive(Debug)]
pub struct TransferableConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TransferableConnection {
    /// Wrap a freshly accepted connection.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    /// Remote address the connection was accepted from.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Master-side end of a worker's channel.
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    stream: Arc<UnixStream>,
}

impl WorkerChannel {
    /// Wrap a connected Unix stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream: Arc::new(stream),
        }
    }

    /// Wrap an owned socket descriptor. Must be called inside a tokio runtime.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self::new(unix_stream_from_fd(fd)?))
    }

    /// Hand a connection to the worker.
    pub async fn send_connection(
        &self,
        conn: TransferableConnection,
    ) -> Result<(), TransferError> {
        let socket_fd = self.stream.as_raw_fd();
        let conn_fd = conn.stream.as_raw_fd();

        let sent = self
            .stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(TRANSFER_TAG)];
                let fds = [conn_fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(socket_fd, &iov, &cmsgs, SEND_FLAGS, None).map_err(io::Error::from)
            })
            .await;

        // The descriptor now lives in the worker (or nowhere); close ours.
        drop(conn);

        match sent {
            Ok(n) if n == TRANSFER_TAG.len() => Ok(()),
            Ok(n) => Err(TransferError::Incomplete {
                written: n,
                expected: TRANSFER_TAG.len(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Reader for worker → master messages.
    pub fn reader(&self) -> MessageReader {
        MessageReader {
            stream: Arc::clone(&self.stream),
            buf: Vec::with_capacity(64),
        }
    }
}

/// Reads newline-terminated [`WorkerMessage`]s from a worker.
pub struct MessageReader {
    stream: Arc<UnixStream>,
    buf: Vec<u8>,
}

impl MessageReader {
    /// Next known message. Returns `None` on EOF.
    pub async fn next_message(&mut self) -> Result<Option<WorkerMessage>, IpcError> {
        let mut chunk = [0u8; 256];
        loop {
            while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match WorkerMessage::from_line(&line) {
                    Some(message) => return Ok(Some(message)),
                    None => tracing::warn!(line = %line.trim(), "Ignoring unknown worker message"),
                }
            }

            if self.buf.len() > MAX_LINE_LEN {
                return Err(IpcError::Oversized { max: MAX_LINE_LEN });
            }

            self.stream.readable().await?;
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Worker-side end of the channel.
#[derive(Debug)]
pub struct MasterChannel {
    stream: UnixStream,
}

impl MasterChannel {
    /// Wrap a connected Unix stream.
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Wrap an inherited descriptor. Must be called inside a tokio runtime.
    ///
    /// # Safety
    /// `fd` must be an open Unix stream socket not owned by anything else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::new(unix_stream_from_fd(owned)?))
    }

    /// Send a message to the master.
    pub async fn send(&self, message: WorkerMessage) -> Result<(), IpcError> {
        let line = message.to_line();
        let bytes = line.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Receive the next transferred connection. Returns `None` when the master
    /// closed the channel.
    pub async fn recv_connection(&self) -> Result<Option<TcpStream>, IpcError> {
        let socket_fd = self.stream.as_raw_fd();

        let (len, frame, fds) = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut frame = [0u8; TRANSFER_TAG.len()];
                let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
                let mut fds: Vec<OwnedFd> = Vec::new();

                let len = {
                    let mut iov = [IoSliceMut::new(&mut frame)];
                    let msg = recvmsg::<()>(
                        socket_fd,
                        &mut iov,
                        Some(&mut cmsg_buffer),
                        MsgFlags::empty(),
                    )
                    .map_err(io::Error::from)?;

                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            // SAFETY: the kernel just installed these descriptors
                            // in our table and nothing else refers to them.
                            fds.extend(
                                received
                                    .into_iter()
                                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                            );
                        }
                    }
                    msg.bytes
                };

                Ok((len, frame, fds))
            })
            .await?;

        if len == 0 && fds.is_empty() {
            return Ok(None);
        }

        if len != TRANSFER_TAG.len() || &frame != TRANSFER_TAG {
            return Err(IpcError::UnexpectedFrame { len });
        }

        let mut fds = fds.into_iter();
        let fd = fds.next().ok_or(IpcError::MissingDescriptor)?;
        // Anything beyond the first descriptor is closed here.
        drop(fds);

        let stream = std::net::TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        Ok(Some(TcpStream::from_std(stream)?))
    }
}

fn unix_stream_from_fd(fd: OwnedFd) -> io::Result<UnixStream> {
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn channel_pair() -> (WorkerChannel, MasterChannel) {
        let (master_end, worker_end) = UnixStream::pair().unwrap();
        (WorkerChannel::new(master_end), MasterChannel::new(worker_end))
    }

    async fn accepted_pair() -> (TcpStream, TransferableConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, TransferableConnection::new(server, peer))
    }

    #[test]
    fn test_worker_message_lines() {
        assert_eq!(WorkerMessage::Ready.to_line(), "worker:ready\n");
        assert_eq!(
            WorkerMessage::from_line("worker:draining\n"),
            Some(WorkerMessage::Draining)
        );
        assert_eq!(WorkerMessage::from_line("worker:unknown"), None);
    }

    #[tokio::test]
    async fn test_messages_reach_master() {
        let (worker_channel, master_channel) = channel_pair();
        let mut reader = worker_channel.reader();

        master_channel.send(WorkerMessage::Ready).await.unwrap();
        master_channel.send(WorkerMessage::Draining).await.unwrap();

        assert_eq!(reader.next_message().await.unwrap(), Some(WorkerMessage::Ready));
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(WorkerMessage::Draining)
        );

        drop(master_channel);
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_tokens_are_skipped() {
        let (master_end, mut worker_end) = UnixStream::pair().unwrap();
        let channel = WorkerChannel::new(master_end);
        let mut reader = channel.reader();

        worker_end.write_all(b"hello\nworker:ready\n").await.unwrap();
        assert_eq!(reader.next_message().await.unwrap(), Some(WorkerMessage::Ready));
    }

    #[tokio::test]
    async fn test_connection_transfer_preserves_bytes() {
        let (worker_channel, master_channel) = channel_pair();
        let (mut client, conn) = accepted_pair().await;

        // Bytes sent before the handoff sit unread in the kernel buffer.
        client.write_all(b"ping").await.unwrap();

        worker_channel.send_connection(conn).await.unwrap();
        let mut adopted = master_channel.recv_connection().await.unwrap().unwrap();

        let mut buf = [0u8; 4];
        adopted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        adopted.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_transfer_to_closed_channel_fails() {
        let (worker_channel, master_channel) = channel_pair();
        drop(master_channel);

        let (mut client, conn) = accepted_pair().await;
        let result = worker_channel.send_connection(conn).await;
        assert!(matches!(result, Err(TransferError::ChannelClosed)));

        // The master dropped its copy, so the client sees the close.
        let mut buf = [0u8; 1];
        let read = client.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_recv_connection_eof() {
        let (worker_channel, master_channel) = channel_pair();
        drop(worker_channel);
        assert!(master_channel.recv_connection().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_rejects_garbage_frame() {
        let (mut master_end, worker_end) = UnixStream::pair().unwrap();
        let channel = MasterChannel::new(worker_end);

        master_end.write_all(b"not-a-transfer").await.unwrap();
        let result = channel.recv_connection().await;
        assert!(matches!(result, Err(IpcError::UnexpectedFrame { .. })));
    }

    #[tokio::test]
    async fn test_recv_without_descriptor() {
        let (mut master_end, worker_end) = UnixStream::pair().unwrap();
        let channel = MasterChannel::new(worker_end);

        master_end.write_all(TRANSFER_TAG).await.unwrap();
        let result = channel.recv_connection().await;
        assert!(matches!(result, Err(IpcError::MissingDescriptor)));
    }
}
