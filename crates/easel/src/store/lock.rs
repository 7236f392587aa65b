//! Per-workspace mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::StoreError;

/// Process-scoped table of workspace locks.
///
/// Waiters queue in FIFO order on a per-workspace async mutex, so concurrent
/// mutations of one workspace apply one after another while different
/// workspaces never contend. Entries nobody holds or waits on are pruned on
/// each acquisition.
#[derive(Debug, Clone)]
pub struct WorkspaceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    timeout: Duration,
}

impl WorkspaceLocks {
    /// Create a lock table whose acquisitions give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Wait for exclusive access to `workspace_id`.
    pub async fn acquire(&self, workspace_id: &str) -> Result<WorkspaceGuard, StoreError> {
        let lock = {
            let mut locks = self.locks.lock();
            // Only the map holds an idle entry.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(workspace_id.to_string()).or_default())
        };

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => {
                let waited = started.elapsed();
                if waited > Duration::from_millis(100) {
                    tracing::debug!(
                        workspace_id = %workspace_id,
                        elapsed_ms = waited.as_millis() as u64,
                        "waited for workspace lock"
                    );
                }
                Ok(WorkspaceGuard { _guard: guard })
            }
            Err(_) => {
                tracing::warn!(
                    workspace_id = %workspace_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "workspace lock timed out"
                );
                Err(StoreError::LockTimeout(workspace_id.to_string()))
            }
        }
    }

    /// Number of workspaces with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Default for WorkspaceLocks {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Exclusive access to one workspace, released on drop.
#[derive(Debug)]
pub struct WorkspaceGuard {
    _guard: OwnedMutexGuard<()>,
}
