//! Worker handle: one worker process as seen by the master

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::WorkerChannel;

// ============================================================================
// Worker State
// ============================================================================

/// Lifecycle state of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Process started, readiness not yet reported
    Spawning,

    /// Accepting forwarded connections
    Ready,

    /// Worker announced its own shutdown
    Draining,

    /// Exit observed; the handle is about to be removed
    Dead,
}

impl WorkerState {
    /// Check if the worker may receive connections
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the process is still expected to be running
    pub fn is_alive(&self) -> bool {
        !matches!(self, Self::Dead)
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Dead => "dead",
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Spawning
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Worker Handle
// ============================================================================

/// A worker process tracked by the pool
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// OS process id
    pub pid: u32,

    /// Pool slot; kept by the replacement when the worker is respawned
    pub ordinal: usize,

    /// Direct listening port, if the worker binds one
    pub port: Option<u16>,

    /// Current lifecycle state
    pub state: WorkerState,

    /// Master end of the worker's IPC channel
    pub channel: WorkerChannel,

    /// When the process was started
    pub spawned_at: DateTime<Utc>,

    /// When the readiness handshake arrived
    pub ready_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
}

impl WorkerHandle {
    /// Create a handle for a freshly spawned worker
    pub fn new(pid: u32, ordinal: usize, port: Option<u16>, channel: WorkerChannel) -> Self {
        Self {
            pid,
            ordinal,
            port,
            state: WorkerState::Spawning,
            channel,
            spawned_at: Utc::now(),
            ready_at: None,
            uptime_secs: 0,
        }
    }

    /// Apply the readiness handshake. Returns false if the handle was not spawning.
    pub fn mark_ready(&mut self) -> bool {
        if self.state != WorkerState::Spawning {
            return false;
        }
        self.state = WorkerState::Ready;
        self.ready_at = Some(Utc::now());
        true
    }

    /// Mark the worker as draining. Returns false if it was already draining or dead.
    pub fn mark_draining(&mut self) -> bool {
        match self.state {
            WorkerState::Spawning | WorkerState::Ready => {
                self.state = WorkerState::Draining;
                true
            }
            WorkerState::Draining | WorkerState::Dead => false,
        }
    }

    /// Mark the worker as dead
    pub fn mark_dead(&mut self) {
        self.state = WorkerState::Dead;
    }

    /// Seconds since the process was started
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.spawned_at).num_seconds()
    }

    /// Serializable view for the admin API
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            pid: self.pid,
            ordinal: self.ordinal,
            port: self.port,
            state: self.state,
            spawned_at: self.spawned_at,
            ready_at: self.ready_at,
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Serializable snapshot of a worker handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub pid: u32,
    pub ordinal: usize,
    pub port: Option<u16>,
    pub state: WorkerState,
    pub spawned_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    fn handle() -> (WorkerHandle, UnixStream) {
        let (master_end, worker_end) = UnixStream::pair().unwrap();
        (
            WorkerHandle::new(42, 1, Some(3002), WorkerChannel::new(master_end)),
            worker_end,
        )
    }

    #[test]
    fn test_state_routable() {
        assert!(WorkerState::Ready.is_routable());
        assert!(!WorkerState::Spawning.is_routable());
        assert!(!WorkerState::Draining.is_routable());
        assert!(!WorkerState::Dead.is_routable());
    }

    #[test]
    fn test_state_alive() {
        assert!(WorkerState::Draining.is_alive());
        assert!(!WorkerState::Dead.is_alive());
    }

    #[tokio::test]
    async fn test_ready_transition() {
        let (mut handle, _peer) = handle();
        assert_eq!(handle.state, WorkerState::Spawning);
        assert!(handle.mark_ready());
        assert!(handle.ready_at.is_some());

        // A second handshake is ignored
        assert!(!handle.mark_ready());
        assert_eq!(handle.state, WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_draining_transition() {
        let (mut handle, _peer) = handle();
        assert!(handle.mark_ready());
        assert!(handle.mark_draining());
        assert!(!handle.mark_draining());

        // Readiness after draining does not make it routable again
        assert!(!handle.mark_ready());
        assert!(!handle.state.is_routable());
    }

    #[tokio::test]
    async fn test_info_serialization() {
        let (handle, _peer) = handle();
        let json = serde_json::to_value(handle.info()).unwrap();
        assert_eq!(json["pid"], 42);
        assert_eq!(json["ordinal"], 1);
        assert_eq!(json["port"], 3002);
        assert_eq!(json["state"], "spawning");
    }
}
