//! Worker process spawning
//!
//! The pool talks to the OS through the [`Spawner`] trait so the supervision
//! logic can be driven by an in-process fake in tests. [`ProcessSpawner`] is
//! the real implementation: it re-executes the current binary with the hidden
//! `worker` subcommand and hands it one end of a Unix socket pair.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use super::channel::WorkerChannel;
use super::exit::TerminationReason;
use crate::error::{Error, Result};

/// Subcommand the worker binary is started with
pub const WORKER_SUBCOMMAND: &str = "worker";

/// What a new worker needs to know about its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Pool slot
    pub ordinal: usize,

    /// Direct listening port, if any
    pub port: Option<u16>,
}

/// A started worker process
pub struct SpawnedWorker {
    /// OS process id
    pub pid: u32,

    /// Master end of the IPC channel
    pub channel: WorkerChannel,

    /// Resolves once the process has exited
    pub exit: BoxFuture<'static, TerminationReason>,
}

impl std::fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("pid", &self.pid)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Creates and signals worker processes
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start a worker for the given slot
    async fn spawn(&self, spec: WorkerSpec) -> Result<SpawnedWorker>;

    /// Ask a worker to shut down gracefully
    fn terminate(&self, pid: u32);

    /// Stop a worker immediately
    fn kill(&self, pid: u32);
}

// ============================================================================
// OS Process Spawner
// ============================================================================

/// Spawns workers as child processes of the current executable
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    global_args: Vec<OsString>,
}

impl ProcessSpawner {
    /// Spawner for the currently running executable
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(program))
    }

    /// Spawner for an explicit program path
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
        }
    }

    /// Arguments placed before the worker subcommand (logging flags, config path)
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.global_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, spec: WorkerSpec, ipc_fd: i32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args);
        cmd.arg(WORKER_SUBCOMMAND);
        cmd.arg("--ordinal").arg(spec.ordinal.to_string());
        cmd.arg("--ipc-fd").arg(ipc_fd.to_string());
        if let Some(port) = spec.port {
            cmd.arg("--port").arg(port.to_string());
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn signal(&self, pid: u32, signal: Signal) {
        let Ok(raw) = i32::try_from(pid) else {
            tracing::warn!(pid, "Refusing to signal out-of-range pid");
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), signal) {
            // ESRCH just means the process already exited
            tracing::debug!(pid, signal = signal.as_str(), error = %e, "Signal not delivered");
        }
    }
}

fn channel_pair() -> Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| Error::spawn(format!("Failed to create IPC socket pair: {}", e)))
}

#[async_trait]
impl Spawner for ProcessSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<SpawnedWorker> {
        let (master_end, worker_end) = channel_pair()?;
        let worker_fd = worker_end.as_raw_fd();

        let mut cmd = self.command(spec, worker_fd);

        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                fcntl(worker_fd, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::spawn(format!("Failed to spawn worker: {}", e)))?;

        // The child holds its own copy now.
        drop(worker_end);

        let pid = child
            .id()
            .ok_or_else(|| Error::spawn("Worker exited before its pid was read"))?;

        let channel = WorkerChannel::from_owned_fd(master_end)?;

        let exit = async move {
            match child.wait().await {
                Ok(status) => TerminationReason::from_exit_status(status),
                Err(e) => {
                    tracing::error!(pid, error = %e, "Failed to wait for worker");
                    TerminationReason::Unknown
                }
            }
        }
        .boxed();

        tracing::debug!(pid, ordinal = spec.ordinal, port = ?spec.port, "Worker process started");

        Ok(SpawnedWorker { pid, channel, exit })
    }

    fn terminate(&self, pid: u32) {
        self.signal(pid, Signal::SIGTERM);
    }

    fn kill(&self, pid: u32) {
        self.signal(pid, Signal::SIGKILL);
    }
}
