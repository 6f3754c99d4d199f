//! Graceful shutdown coordinator
//!
//! Every process (master and workers) owns one [`Shutdown`]. It moves through
//! `Running → Draining → Terminated` exactly once:
//!
//! - [`Shutdown::begin`] is called by a trigger: a termination signal, a panic
//!   (through the hook installed by [`Shutdown::install_panic_hook`]), a
//!   supervised task that failed ([`Shutdown::watch_task`]), or the loss of
//!   the master channel in a worker.
//! - Servers stop accepting as soon as [`Shutdown::wait`] resolves.
//! - [`Shutdown::drain`] gives in-flight work until the drain deadline and
//!   then force-closes whatever is left.
//! - [`Shutdown::finish`] marks the process terminated and picks the exit code.

use std::fmt;
use std::future::Future;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::ShutdownConfig;

/// How long to wait for the server to notice force-closed connections
pub const FORCE_CLOSE_GRACE: Duration = Duration::from_millis(500);

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATED: u8 = 2;

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// What started the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// SIGINT or SIGTERM
    Signal(&'static str),
    /// Panic or failed supervised task
    Fault(String),
    /// The master channel closed (workers only)
    MasterGone,
}

impl ShutdownTrigger {
    /// Whether this trigger forces an abnormal exit
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {}", name),
            Self::Fault(msg) => write!(f, "fault: {}", msg),
            Self::MasterGone => write!(f, "master channel closed"),
        }
    }
}

/// Result of the drain phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight work finished before the deadline
    Drained,
    /// The deadline passed; `forced` connections or processes were cut off
    DeadlineElapsed { forced: usize },
}

#[derive(Debug, Default)]
struct ShutdownState {
    phase: AtomicU8,
    faulted: AtomicBool,
    trigger: Mutex<Option<ShutdownTrigger>>,
    notify: Notify,
}

/// Per-process shutdown coordinator; cheap to clone
#[derive(Debug, Clone)]
pub struct Shutdown {
    state: Arc<ShutdownState>,
    drain_timeout: Duration,
}

impl Shutdown {
    /// Create a coordinator with the given drain deadline
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            state: Arc::new(ShutdownState::default()),
            drain_timeout,
        }
    }

    /// Create a coordinator from configuration
    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::new(config.drain_timeout())
    }

    /// Drain deadline
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Start draining. Returns false if a shutdown was already in progress.
    pub fn begin(&self, trigger: ShutdownTrigger) -> bool {
        if trigger.is_fault() {
            self.state.faulted.store(true, Ordering::SeqCst);
        }

        if self
            .state
            .phase
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(%trigger, "Shutdown already in progress");
            return false;
        }

        if trigger.is_fault() {
            tracing::error!(%trigger, "Shutting down");
        } else {
            tracing::info!(%trigger, "Shutting down");
        }

        *self
            .state
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trigger);
        self.state.notify.notify_waiters();
        true
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        match self.state.phase.load(Ordering::SeqCst) {
            RUNNING => Phase::Running,
            DRAINING => Phase::Draining,
            _ => Phase::Terminated,
        }
    }

    /// Whether a shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != Phase::Running
    }

    /// The trigger that started the shutdown
    pub fn trigger(&self) -> Option<ShutdownTrigger> {
        self.state
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolves once a shutdown has started
    pub async fn wait(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent begin() is not missed
        notified.as_mut().enable();

        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Owned future resolving on shutdown, for APIs that need `'static`
    pub fn signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let shutdown = self.clone();
        async move { shutdown.wait().await }
    }

    /// Run `server` until shutdown starts, then give it the drain deadline.
    ///
    /// `server` must stop accepting once [`Shutdown::wait`] resolves and
    /// complete when in-flight work is done. When the deadline passes,
    /// `force_close` is called and its return value is reported as the
    /// number of connections cut off.
    pub async fn drain<F, E, C>(&self, server: F, force_close: C) -> DrainOutcome
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
        C: FnOnce() -> usize,
    {
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                match result {
                    Err(e) => {
                        self.begin(ShutdownTrigger::Fault(format!("server failed: {}", e)));
                    }
                    Ok(()) if !self.is_shutting_down() => {
                        self.begin(ShutdownTrigger::Fault("server stopped unexpectedly".to_string()));
                    }
                    Ok(()) => {}
                }
                return DrainOutcome::Drained;
            }
            _ = self.wait() => {}
        }

        tracing::info!(timeout_secs = self.drain_timeout.as_secs_f64(), "Draining in-flight connections");

        if tokio::time::timeout(self.drain_timeout, &mut server).await.is_ok() {
            return DrainOutcome::Drained;
        }

        let forced = force_close();
        tracing::warn!(forced, "Drain deadline elapsed; closing remaining connections");
        let _ = tokio::time::timeout(FORCE_CLOSE_GRACE, &mut server).await;

        DrainOutcome::DeadlineElapsed { forced }
    }

    /// Mark the process terminated and compute its exit code
    pub fn finish(&self, outcome: DrainOutcome) -> ExitCode {
        self.state.phase.store(TERMINATED, Ordering::SeqCst);

        let code = self.exit_code(outcome);
        tracing::info!(?outcome, trigger = ?self.trigger(), exit_code = code, "Terminated");
        ExitCode::from(code)
    }

    /// Exit code for an outcome: faults always exit 1, otherwise 0 if drained
    pub fn exit_code(&self, outcome: DrainOutcome) -> u8 {
        if self.state.faulted.load(Ordering::SeqCst) {
            return 1;
        }
        match outcome {
            DrainOutcome::Drained => 0,
            DrainOutcome::DeadlineElapsed { .. } => 1,
        }
    }

    /// Start draining on SIGINT or SIGTERM
    pub fn install_signal_handlers(&self) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let shutdown = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                };
                shutdown.begin(ShutdownTrigger::Signal(name));
            }
        }))
    }

    /// Start draining when any thread panics
    pub fn install_panic_hook(&self) {
        let shutdown = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            shutdown.begin(ShutdownTrigger::Fault(format!("panic: {}", info)));
        }));
    }

    /// Spawn a task whose failure (error or panic) starts a fault shutdown
    pub fn watch_task<F, E>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let shutdown = self.clone();
        let inner = tokio::spawn(task);

        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task finished"),
                Ok(Err(e)) => {
                    shutdown.begin(ShutdownTrigger::Fault(format!("{} failed: {}", name, e)));
                }
                Err(e) if e.is_panic() => {
                    shutdown.begin(ShutdownTrigger::Fault(format!("{} panicked", name)));
                }
                Err(_) => tracing::debug!(task = name, "Task cancelled"),
            }
        })
    }
}
