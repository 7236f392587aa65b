//! One sandbox per workspace, expired after a period of disuse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Sandbox, SandboxError};
use crate::config::EaselConfig;
use crate::policy::{PolicyError, PolicyHandler};
use crate::store::WorkspaceStore;

/// How often idle sessions are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

type Factory = dyn Fn(&str) -> Result<Sandbox, SandboxError> + Send + Sync;

struct Session {
    sandbox: Arc<Sandbox>,
    last_used: Instant,
}

/// Process-wide cache of sandboxes keyed by workspace ID.
pub struct SandboxManager {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
    factory: Box<Factory>,
    cleanup: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("sessions", &self.sessions.lock().len())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Create a manager that builds sandboxes with `factory`.
    pub fn new<F>(idle_timeout: Duration, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Sandbox, SandboxError> + Send + Sync + 'static,
    {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            factory: Box::new(factory),
            cleanup: Mutex::new(None),
        }
    }

    /// Create a manager whose sandboxes follow `config`.
    ///
    /// Fails if the `[files]` rules do not compile.
    pub fn from_config(store: WorkspaceStore, config: &EaselConfig) -> Result<Self, PolicyError> {
        let policy: Arc<dyn PolicyHandler> = Arc::new(config.file_policy()?);
        let limits = config.limits.clone();
        let skills_dir = config.skills_dir.clone();
        let env_allowlist = config.env_allowlist.clone();
        Ok(Self::new(config.sandbox_idle_timeout, move |workspace_id| {
            Sandbox::builder(workspace_id, store.clone())
                .limits(limits.clone())
                .policy_arc(policy.clone())
                .skills_dir(skills_dir.clone())
                .env_allowlist(env_allowlist.iter().cloned())
                .build()
        }))
    }

    /// The sandbox for `workspace_id`, created on first use.
    pub fn get_or_create(&self, workspace_id: &str) -> Result<Arc<Sandbox>, SandboxError> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(workspace_id) {
            session.last_used = Instant::now();
            return Ok(session.sandbox.clone());
        }

        let sandbox = Arc::new((self.factory)(workspace_id)?);
        sessions.insert(
            workspace_id.to_string(),
            Session {
                sandbox: sandbox.clone(),
                last_used: Instant::now(),
            },
        );
        tracing::info!(workspace_id = %workspace_id, "created sandbox session");
        Ok(sandbox)
    }

    /// Drop the session for `workspace_id`; returns whether one existed.
    pub fn destroy(&self, workspace_id: &str) -> bool {
        let removed = self.sessions.lock().remove(workspace_id).is_some();
        if removed {
            tracing::info!(workspace_id = %workspace_id, "destroyed sandbox session");
        }
        removed
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drop every session idle for longer than the idle timeout; returns
    /// how many were removed.
    pub fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|workspace_id, session| {
            let keep = now.duration_since(session.last_used) <= self.idle_timeout;
            if !keep {
                tracing::info!(workspace_id = %workspace_id, "expiring idle sandbox session");
            }
            keep
        });
        before - sessions.len()
    }

    /// Start the periodic idle sweep. Calling this twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let manager = Arc::downgrade(self);
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let removed = manager.cleanup_idle();
                        if removed > 0 {
                            tracing::debug!(removed, "swept idle sandbox sessions");
                        }
                    }
                }
            }
        });
        *cleanup = Some((token, handle));
        tracing::info!("sandbox manager started");
    }

    /// Stop the sweep and drop every session.
    pub async fn stop(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some((token, handle)) = cleanup {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sandbox cleanup task failed");
            }
        }
        self.sessions.lock().clear();
        tracing::info!("sandbox manager stopped");
    }
}
