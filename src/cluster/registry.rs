//! Worker registry
//!
//! The registry is an explicitly owned object. The pool holds the only
//! [`WorkerRegistry`] (the writer); the router and the admin API get a
//! [`RegistryReader`] that can look but not mutate.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::handle::{WorkerHandle, WorkerInfo, WorkerState};

type Handles = Arc<RwLock<Vec<WorkerHandle>>>;

// ============================================================================
// Writer
// ============================================================================

/// Mutable view of the worker set, owned by the pool
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    handles: Handles,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view for other components
    pub fn reader(&self) -> RegistryReader {
        RegistryReader {
            handles: Arc::clone(&self.handles),
        }
    }

    /// Add a handle
    pub async fn insert(&self, handle: WorkerHandle) {
        self.handles.write().await.push(handle);
    }

    /// Remove the handle for `pid`
    pub async fn remove(&self, pid: u32) -> Option<WorkerHandle> {
        let mut handles = self.handles.write().await;
        let index = handles.iter().position(|h| h.pid == pid)?;
        Some(handles.remove(index))
    }

    /// Mutate the handle for `pid` in place. Returns `None` if it is unknown.
    pub async fn update<F, R>(&self, pid: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut WorkerHandle) -> R,
    {
        let mut handles = self.handles.write().await;
        handles.iter_mut().find(|h| h.pid == pid).map(f)
    }

    /// Pids of all tracked workers
    pub async fn pids(&self) -> Vec<u32> {
        self.handles.read().await.iter().map(|h| h.pid).collect()
    }

    /// Number of tracked workers
    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Check if no worker is tracked
    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read-only view of the worker set
#[derive(Debug, Clone)]
pub struct RegistryReader {
    handles: Handles,
}

impl RegistryReader {
    /// Ready workers ordered by ordinal, taken under a single lock acquisition
    pub async fn ready_snapshot(&self) -> Vec<WorkerHandle> {
        let handles = self.handles.read().await;
        let mut ready: Vec<WorkerHandle> = handles
            .iter()
            .filter(|h| h.state.is_routable())
            .cloned()
            .collect();
        ready.sort_by_key(|h| h.ordinal);
        ready
    }

    /// Number of ready workers
    pub async fn ready_count(&self) -> usize {
        self.handles
            .read()
            .await
            .iter()
            .filter(|h| h.state.is_routable())
            .count()
    }

    /// Look up a worker by pid
    pub async fn get(&self, pid: u32) -> Option<WorkerInfo> {
        self.handles
            .read()
            .await
            .iter()
            .find(|h| h.pid == pid)
            .map(WorkerHandle::info)
    }

    /// All workers ordered by ordinal
    pub async fn all(&self) -> Vec<WorkerInfo> {
        let mut all: Vec<WorkerInfo> = self.handles.read().await.iter().map(WorkerHandle::info).collect();
        all.sort_by_key(|w| (w.ordinal, w.pid));
        all
    }

    /// Get registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let handles = self.handles.read().await;

        let mut stats = RegistryStats {
            total: handles.len(),
            ..RegistryStats::default()
        };

        for handle in handles.iter() {
            if handle.state.is_alive() {
                stats.alive += 1;
            }
            match handle.state {
                WorkerState::Spawning => stats.spawning += 1,
                WorkerState::Ready => stats.ready += 1,
                WorkerState::Draining => stats.draining += 1,
                WorkerState::Dead => stats.dead += 1,
            }
        }

        stats
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    /// Handles whose process has not been seen exiting
    pub alive: usize,
    pub spawning: usize,
    pub ready: usize,
    pub draining: usize,
    pub dead: usize,
}

impl RegistryStats {
    /// Get the share of ready workers as a percentage
    pub fn availability(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.ready as f64 / self.total as f64) * 100.0
        }
    }
}
