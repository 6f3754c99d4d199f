//! Worker pool manager
//!
//! Owns the [`WorkerRegistry`] writer and is the only code that mutates it.
//! Every worker gets two helper tasks that feed the pool's event queue: one
//! reads the worker's IPC messages, the other awaits its exit. The pool then
//! applies events one at a time, so handle transitions never interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::instrument;

use super::channel::WorkerMessage;
use super::exit::TerminationReason;
use super::handle::{WorkerHandle, WorkerState};
use super::registry::{RegistryReader, WorkerRegistry};
use super::spawn::{SpawnedWorker, Spawner, WorkerSpec};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::metrics;
use crate::shutdown::{DrainOutcome, Shutdown};

/// How long to wait for exits after SIGKILL before giving up on a worker
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Event applied by the pool loop
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// Worker sent the readiness handshake
    Ready { pid: u32 },

    /// Worker announced it is draining
    Draining { pid: u32 },

    /// Worker channel failed in a way that leaves it unusable
    ChannelFailed { pid: u32, error: String },

    /// Worker process exited
    Exited { pid: u32, reason: TerminationReason },

    /// Worker did not report ready within the readiness timeout
    ReadyTimeout { pid: u32 },

    /// Retry a respawn that failed earlier
    RespawnDue { ordinal: usize },
}

/// Supervises the worker processes
pub struct WorkerPool {
    config: ClusterConfig,
    spawner: Arc<dyn Spawner>,
    registry: WorkerRegistry,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    shutting_down: bool,
    respawns: u64,
}

impl WorkerPool {
    /// Create a pool; no worker is started until [`WorkerPool::spawn`]
    pub fn new(config: ClusterConfig, spawner: Arc<dyn Spawner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            spawner,
            registry: WorkerRegistry::new(),
            events_tx,
            events_rx,
            shutting_down: false,
            respawns: 0,
        }
    }

    /// Read-only registry view for the router and the admin API
    pub fn reader(&self) -> RegistryReader {
        self.registry.reader()
    }

    /// Number of replacements started so far
    pub fn respawn_count(&self) -> u64 {
        self.respawns
    }

    /// Start `n` workers on ordinals `0..n`. The first spawn failure is returned.
    pub async fn spawn(&mut self, n: usize) -> Result<()> {
        tracing::info!(workers = n, "Starting workers");
        for ordinal in 0..n {
            self.spawn_worker(ordinal).await?;
        }
        Ok(())
    }

    /// Start one worker on `ordinal` and register it as spawning
    #[instrument(skip(self))]
    async fn spawn_worker(&mut self, ordinal: usize) -> Result<u32> {
        let spec = WorkerSpec {
            ordinal,
            port: self.config.worker_port(ordinal),
        };

        let spawned = match self.spawner.spawn(spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                metrics::record_spawn_failure();
                return Err(e);
            }
        };

        let SpawnedWorker { pid, channel, exit } = spawned;
        let handle = WorkerHandle::new(pid, ordinal, spec.port, channel.clone());
        self.registry.insert(handle).await;
        metrics::record_worker_spawned();

        // Message reader
        let tx = self.events_tx.clone();
        let mut reader = channel.reader();
        tokio::spawn(async move {
            loop {
                match reader.next_message().await {
                    Ok(Some(WorkerMessage::Ready)) => {
                        let _ = tx.send(PoolEvent::Ready { pid });
                    }
                    Ok(Some(WorkerMessage::Draining)) => {
                        let _ = tx.send(PoolEvent::Draining { pid });
                    }
                    Ok(None) => {
                        tracing::debug!(pid, "Worker channel closed");
                        break;
                    }
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!(pid, error = %e, "Worker channel error");
                    }
                    Err(e) => {
                        let _ = tx.send(PoolEvent::ChannelFailed {
                            pid,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        });

        // Exit watcher
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reason = exit.await;
            let _ = tx.send(PoolEvent::Exited { pid, reason });
        });

        if let Some(timeout) = self.config.ready_timeout() {
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(PoolEvent::ReadyTimeout { pid });
            });
        }

        tracing::info!(pid, ordinal, port = ?spec.port, "Worker spawned");
        Ok(pid)
    }

    /// Readiness handshake received
    pub async fn on_ready(&mut self, pid: u32) {
        match self.registry.update(pid, |h| (h.mark_ready(), h.ordinal)).await {
            Some((true, ordinal)) => {
                tracing::info!(pid, ordinal, "Worker is ready");
                self.publish_ready_count().await;
            }
            Some((false, ordinal)) => {
                tracing::debug!(pid, ordinal, "Ignoring readiness from a worker that is not spawning");
            }
            None => tracing::debug!(pid, "Readiness from unknown worker"),
        }
    }

    /// Worker started its own graceful shutdown
    pub async fn on_draining(&mut self, pid: u32) {
        if let Some((true, ordinal)) = self
            .registry
            .update(pid, |h| (h.mark_draining(), h.ordinal))
            .await
        {
            tracing::info!(pid, ordinal, "Worker is draining");
            self.publish_ready_count().await;
        }
    }

    /// Worker process exited: drop its handle and start exactly one replacement
    pub async fn on_exit(&mut self, pid: u32, reason: TerminationReason) {
        let Some(mut handle) = self.registry.remove(pid).await else {
            tracing::debug!(pid, %reason, "Exit from unknown worker");
            return;
        };
        handle.mark_dead();
        self.publish_ready_count().await;
        metrics::record_worker_exit(reason.label());

        if self.shutting_down {
            if reason.is_success() {
                tracing::info!(pid, ordinal = handle.ordinal, "Worker exited");
            } else {
                tracing::warn!(
                    pid,
                    ordinal = handle.ordinal,
                    code = ?reason.code(),
                    signal = ?reason.signal().map(|s| s.as_str()),
                    "Worker exited abnormally during shutdown"
                );
            }
            return;
        }

        tracing::error!(
            pid,
            ordinal = handle.ordinal,
            code = ?reason.code(),
            signal = ?reason.signal().map(|s| s.as_str()),
            "Worker died ({}). Starting a new worker",
            reason
        );

        self.respawn(handle.ordinal).await;
    }

    async fn respawn(&mut self, ordinal: usize) {
        if self.shutting_down {
            return;
        }

        match self.spawn_worker(ordinal).await {
            Ok(pid) => {
                self.respawns += 1;
                tracing::info!(pid, ordinal, "Replacement worker started");
            }
            Err(e) if !e.is_recoverable() => {
                tracing::error!(
                    ordinal,
                    error = %e,
                    category = e.category().label(),
                    "Failed to respawn worker; leaving the slot empty"
                );
            }
            Err(e) => {
                let backoff = self.config.respawn_backoff();
                tracing::error!(
                    ordinal,
                    error = %e,
                    category = e.category().label(),
                    retry_in_ms = backoff.as_millis() as u64,
                    "Failed to respawn worker"
                );
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(PoolEvent::RespawnDue { ordinal });
                });
            }
        }
    }

    async fn on_ready_timeout(&mut self, pid: u32) {
        let state = self.registry.update(pid, |h| h.state).await;
        if state == Some(WorkerState::Spawning) {
            tracing::warn!(
                pid,
                timeout_secs = ?self.config.ready_timeout_secs,
                "Worker did not report ready in time; terminating"
            );
            self.spawner.terminate(pid);
        }
    }

    async fn on_channel_failed(&mut self, pid: u32, error: &str) {
        tracing::error!(pid, error, "Worker channel unusable; terminating worker");
        self.registry.update(pid, |h| h.mark_draining()).await;
        self.publish_ready_count().await;
        self.spawner.terminate(pid);
    }

    /// Apply one event
    pub async fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Ready { pid } => self.on_ready(pid).await,
            PoolEvent::Draining { pid } => self.on_draining(pid).await,
            PoolEvent::ChannelFailed { pid, error } => self.on_channel_failed(pid, &error).await,
            PoolEvent::Exited { pid, reason } => self.on_exit(pid, reason).await,
            PoolEvent::ReadyTimeout { pid } => self.on_ready_timeout(pid).await,
            PoolEvent::RespawnDue { ordinal } => self.respawn(ordinal).await,
        }
    }

    /// Wait for the next event, apply it, and return it
    pub async fn process_next_event(&mut self) -> Option<PoolEvent> {
        let event = self.events_rx.recv().await?;
        tracing::trace!(?event, "Pool event");
        self.handle_event(event.clone()).await;
        Some(event)
    }

    /// Supervise workers until shutdown, then stop them within the drain deadline
    pub async fn run(mut self, shutdown: Shutdown) -> DrainOutcome {
        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                event = self.events_rx.recv() => event,
            };
            let Some(event) = event else { break };
            tracing::trace!(?event, "Pool event");
            self.handle_event(event).await;
        }

        self.shutdown_workers(shutdown.drain_timeout()).await
    }

    /// Stop respawning, SIGTERM every worker, and SIGKILL those still alive at the deadline
    pub async fn shutdown_workers(&mut self, deadline: Duration) -> DrainOutcome {
        self.shutting_down = true;

        let pids = self.registry.pids().await;
        tracing::info!(workers = pids.len(), "Stopping workers");
        for pid in &pids {
            self.spawner.terminate(*pid);
        }

        if self.wait_for_exits(Instant::now() + deadline).await {
            return DrainOutcome::Drained;
        }

        let stragglers = self.registry.pids().await;
        tracing::warn!(workers = stragglers.len(), "Workers still running at the deadline; killing");
        for pid in &stragglers {
            self.spawner.kill(*pid);
        }
        self.wait_for_exits(Instant::now() + KILL_GRACE).await;

        DrainOutcome::DeadlineElapsed {
            forced: stragglers.len(),
        }
    }

    async fn wait_for_exits(&mut self, deadline: Instant) -> bool {
        while !self.registry.is_empty().await {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    async fn publish_ready_count(&self) {
        metrics::set_ready_workers(self.registry.reader().ready_count().await);
    }
}
