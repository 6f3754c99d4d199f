//! Common test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};

use stickypool::cluster::{
    MasterChannel, SpawnedWorker, Spawner, TerminationReason, WorkerChannel, WorkerPool,
    WorkerSpec,
};
use stickypool::config::ClusterConfig;
use stickypool::error::{Error, Result};

/// The worker end of a fake worker process
#[derive(Debug)]
pub struct FakeWorker {
    pub pid: u32,
    pub ordinal: usize,
    pub port: Option<u16>,
    pub channel: MasterChannel,
}

/// Spawner whose workers live in the test: each one is a socket pair plus a
/// oneshot that plays the role of the process exit.
#[derive(Debug)]
pub struct FakeSpawner {
    next_pid: AtomicU32,
    failing: AtomicBool,
    fatal: AtomicBool,
    exits: Mutex<HashMap<u32, oneshot::Sender<TerminationReason>>>,
    terminated: Mutex<Vec<u32>>,
    workers: mpsc::UnboundedSender<FakeWorker>,
}

impl FakeSpawner {
    /// Create a spawner and the receiver its workers are delivered on
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            failing: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            exits: Mutex::new(HashMap::new()),
            terminated: Mutex::new(Vec::new()),
            workers: tx,
        });
        (spawner, rx)
    }

    /// Make the process exit with `reason`
    pub fn crash(&self, pid: u32, reason: TerminationReason) {
        if let Some(tx) = self.exits.lock().unwrap().remove(&pid) {
            let _ = tx.send(reason);
        }
    }

    /// Make subsequent spawns fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make subsequent spawns fail with an error that is not worth retrying
    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    /// Pids that received a graceful termination request
    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<SpawnedWorker> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::spawn("fake spawn failure"));
        }
        if self.fatal.load(Ordering::SeqCst) {
            return Err(Error::config("fake worker command is unusable"));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (master_end, worker_end) = UnixStream::pair()?;
        let (exit_tx, exit_rx) = oneshot::channel();
        self.exits.lock().unwrap().insert(pid, exit_tx);

        let _ = self.workers.send(FakeWorker {
            pid,
            ordinal: spec.ordinal,
            port: spec.port,
            channel: MasterChannel::new(worker_end),
        });

        Ok(SpawnedWorker {
            pid,
            channel: WorkerChannel::new(master_end),
            exit: exit_rx
                .map(|reason| reason.unwrap_or(TerminationReason::Unknown))
                .boxed(),
        })
    }

    fn terminate(&self, pid: u32) {
        self.terminated.lock().unwrap().push(pid);
        self.crash(pid, TerminationReason::Exited(0));
    }

    fn kill(&self, pid: u32) {
        self.crash(
            pid,
            TerminationReason::Signaled(nix::sys::signal::Signal::SIGKILL),
        );
    }
}

/// Cluster settings for fake pools
pub fn cluster_config(workers: usize) -> ClusterConfig {
    ClusterConfig::builder()
        .port(7000)
        .workers(workers)
        .respawn_backoff_ms(20)
        .build()
        .unwrap()
}

/// Spawn `n` fake workers and complete their readiness handshake
pub async fn ready_pool(n: usize) -> (WorkerPool, Arc<FakeSpawner>, Vec<FakeWorker>) {
    let (spawner, mut rx) = FakeSpawner::new();
    let mut pool = WorkerPool::new(cluster_config(n), spawner.clone());
    pool.spawn(n).await.unwrap();

    let mut workers = Vec::with_capacity(n);
    for _ in 0..n {
        let worker = rx.recv().await.unwrap();
        worker
            .channel
            .send(stickypool::cluster::WorkerMessage::Ready)
            .await
            .unwrap();
        workers.push(worker);
    }
    for _ in 0..n {
        pool.process_next_event().await.unwrap();
    }
    assert_eq!(pool.reader().ready_count().await, n);

    workers.sort_by_key(|w| w.ordinal);
    (pool, spawner, workers)
}

/// A connected TCP pair: (client, accepted server side)
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

/// Client address with the given octets
pub fn peer(a: u8, b: u8, c: u8, d: u8) -> SocketAddr {
    SocketAddr::from(([a, b, c, d], 40000))
}

/// Send a raw HTTP request and read the whole response
pub async fn http_exchange(stream: &mut TcpStream, request: &str) -> String {
    try_http_exchange(stream, request).await.unwrap()
}

/// Like [`http_exchange`], but hands back I/O errors such as a reset from a
/// master that is still waiting for its first worker
pub async fn try_http_exchange(stream: &mut TcpStream, request: &str) -> io::Result<String> {
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response timed out"))??;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// `POST /verify` with a JSON body, closing the connection afterwards
pub fn verify_request(body: &str) -> String {
    format!(
        "POST /verify HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}
