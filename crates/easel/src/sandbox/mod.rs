//! Capability-restricted JavaScript execution for agent snippets.
//!
//! A [`Sandbox`] is bound to one workspace. Each [`Sandbox::execute`] call
//! runs a snippet in a fresh QuickJS context whose only way to reach the
//! outside world is the set of capability functions installed by the
//! prelude (`read`, `setTable`, `fetch`, ...). The snippet body may use
//! top-level `await` and `return`; its return value becomes the text the
//! agent sees.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use easel::sandbox::Sandbox;
//! use easel::store::WorkspaceStore;
//!
//! let store = WorkspaceStore::new("data", Duration::from_secs(10));
//! let sandbox = Sandbox::builder("demo", store).build()?;
//!
//! let output = sandbox
//!     .execute("await setTable('sales', { data: [{ region: 'EU', total: 3 }] }); return 'ok';")
//!     .await?;
//! println!("{}", output.text);
//! # Ok(())
//! # }
//! ```

mod engine;
mod files;
mod host;
mod manager;
mod net;
mod remote;
mod skills;
mod transform;
mod ui;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use self::engine::ScriptResult;
use self::host::{Host, SandboxContext};
use crate::limits::SandboxLimits;
use crate::panel::{PanelUpdate, PanelUpdateQueue, embed_panel_updates};
use crate::policy::{AllowAllPolicy, PolicyHandler};
use crate::store::{StoreError, WorkspaceStore, validate_id};

pub use engine::TimeoutKind;
pub use files::{AreaPath, EntryKind, FileArea, FileEntry, SearchMatch};
pub use manager::SandboxManager;
pub use net::{FetchRequest, FetchResponse, Resolver, StaticResolver, SystemResolver, check_url, is_blocked_ip};
pub use remote::{Artifact, PythonResult, RemoteError, RemoteExecutor};
pub use skills::SkillSummary;

/// Failure of a single capability call. Surfaces inside the snippet as a
/// thrown `Error` carrying this message.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Arguments had the wrong shape.
    #[error("{0}")]
    InvalidArgument(String),

    /// Path escaped the files area or was malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Network destination not allowed.
    #[error("blocked: {0}")]
    Blocked(String),

    /// Environment variable not on the allow-list.
    #[error("environment variable {0} is not allowed")]
    EnvNotAllowed(String),

    /// Referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Access policy denied the operation.
    #[error("permission denied: {0}")]
    Policy(String),

    /// Outbound request failed.
    #[error("network error: {0}")]
    Network(String),

    /// Workspace store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No capability with this name.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

/// Failure to run a snippet at all, as opposed to the snippet failing.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The engine could not be started or configured.
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    /// The engine stopped unexpectedly.
    #[error("sandbox engine failure: {0}")]
    Engine(String),
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The snippet returned normally.
    Completed,
    /// The snippet threw.
    Failed,
    /// The snippet hit a time limit.
    TimedOut,
}

/// Result of one [`Sandbox::execute`] call.
#[derive(Debug, Clone)]
pub struct ExecuteOutput {
    /// Text handed back to the agent, with panel updates embedded.
    pub text: String,
    /// How the snippet ended.
    pub outcome: Outcome,
    /// Every panel update the snippet produced, in order.
    pub panel_updates: Vec<PanelUpdate>,
    /// Captured `log`/`console` output.
    pub logs: String,
}

impl ExecuteOutput {
    /// Whether the snippet ran to completion.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

/// A JavaScript sandbox bound to one workspace.
pub struct Sandbox {
    ctx: Arc<SandboxContext>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("workspace_id", &self.ctx.workspace_id)
            .field("limits", &self.ctx.limits)
            .field("files", &self.ctx.files)
            .field("skills_dir", &self.ctx.skills_dir)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Start configuring a sandbox for `workspace_id`.
    pub fn builder(workspace_id: impl Into<String>, store: WorkspaceStore) -> SandboxBuilder {
        SandboxBuilder::new(workspace_id, store)
    }

    /// The workspace this sandbox acts on.
    pub fn workspace_id(&self) -> &str {
        &self.ctx.workspace_id
    }

    /// Limits applied to every execution.
    pub fn limits(&self) -> &SandboxLimits {
        &self.ctx.limits
    }

    /// Run a snippet, collecting panel updates into the result only.
    pub async fn execute(&self, code: &str) -> Result<ExecuteOutput, SandboxError> {
        self.run(code, None).await
    }

    /// Run a snippet, also pushing each panel update to `queue` the moment
    /// it happens.
    pub async fn execute_streaming(
        &self,
        code: &str,
        queue: &PanelUpdateQueue,
    ) -> Result<ExecuteOutput, SandboxError> {
        self.run(code, Some(queue.clone())).await
    }

    async fn run(&self, code: &str, queue: Option<PanelUpdateQueue>) -> Result<ExecuteOutput, SandboxError> {
        let workspace_id = &self.ctx.workspace_id;
        let started = Instant::now();
        tracing::info!(workspace_id = %workspace_id, code_bytes = code.len(), "executing snippet");

        let host = Arc::new(Host::new(self.ctx.clone(), queue));
        let result = engine::run(host.clone(), code, &self.ctx.limits).await?;

        let logs = host.logs();
        let panel_updates = host.updates();
        let (text, outcome) = render(&result, &logs, &panel_updates, &self.ctx.limits);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            ScriptResult::TimedOut(kind) => {
                tracing::warn!(workspace_id = %workspace_id, ?kind, elapsed_ms, "snippet timed out");
            }
            ScriptResult::Threw(message) => {
                tracing::info!(workspace_id = %workspace_id, elapsed_ms, error = %message, "snippet threw");
            }
            ScriptResult::Returned(_) => {
                tracing::info!(
                    workspace_id = %workspace_id,
                    elapsed_ms,
                    panel_updates = panel_updates.len(),
                    "snippet completed"
                );
            }
        }

        Ok(ExecuteOutput {
            text,
            outcome,
            panel_updates,
            logs,
        })
    }
}

fn render(
    result: &ScriptResult,
    logs: &str,
    updates: &[PanelUpdate],
    limits: &SandboxLimits,
) -> (String, Outcome) {
    let mut text = String::new();
    if !logs.is_empty() {
        text.push_str("Logs:\n");
        text.push_str(logs.trim_end());
        text.push_str("\n\n");
    }

    let outcome = match result {
        ScriptResult::Returned(None) => {
            text.push_str("(no return value)");
            Outcome::Completed
        }
        ScriptResult::Returned(Some(serde_json::Value::String(s))) => {
            text.push_str(s);
            Outcome::Completed
        }
        ScriptResult::Returned(Some(value)) => {
            let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            text.push_str(&pretty);
            Outcome::Completed
        }
        ScriptResult::Threw(message) => {
            text.push_str("Error: ");
            text.push_str(message);
            Outcome::Failed
        }
        ScriptResult::TimedOut(TimeoutKind::Script) => {
            text.push_str(&format!(
                "Timeout: script exceeded the {} ms execution limit",
                limits.script_timeout.as_millis()
            ));
            Outcome::TimedOut
        }
        ScriptResult::TimedOut(TimeoutKind::Async) => {
            text.push_str(&format!(
                "Timeout: snippet did not complete within {} ms",
                limits.async_timeout.as_millis()
            ));
            Outcome::TimedOut
        }
    };

    (embed_panel_updates(&text, updates), outcome)
}

/// Builder for [`Sandbox`].
pub struct SandboxBuilder {
    workspace_id: String,
    store: WorkspaceStore,
    limits: SandboxLimits,
    policy: Arc<dyn PolicyHandler>,
    resolver: Arc<dyn Resolver>,
    skills_dir: Option<PathBuf>,
    env_allowlist: HashSet<String>,
}

impl std::fmt::Debug for SandboxBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBuilder")
            .field("workspace_id", &self.workspace_id)
            .field("store", &self.store)
            .field("limits", &self.limits)
            .field("skills_dir", &self.skills_dir)
            .field("env_allowlist", &self.env_allowlist)
            .finish_non_exhaustive()
    }
}

impl SandboxBuilder {
    /// Create a builder with default limits, an allow-all file policy and
    /// the system DNS resolver.
    pub fn new(workspace_id: impl Into<String>, store: WorkspaceStore) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            store,
            limits: SandboxLimits::default(),
            policy: Arc::new(AllowAllPolicy),
            resolver: Arc::new(SystemResolver),
            skills_dir: None,
            env_allowlist: HashSet::new(),
        }
    }

    /// Set resource limits.
    pub fn limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the file-area access policy.
    pub fn policy(mut self, policy: impl PolicyHandler + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Set a shared file-area access policy.
    pub fn policy_arc(mut self, policy: Arc<dyn PolicyHandler>) -> Self {
        self.policy = policy;
        self
    }

    /// Set the resolver used by the `fetch` guard.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Directory served by `listSkills`/`readSkill`.
    pub fn skills_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.skills_dir = Some(dir.into());
        self
    }

    /// Environment variables `env()` may read.
    pub fn env_allowlist(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env_allowlist = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Build the sandbox.
    pub fn build(self) -> Result<Sandbox, SandboxError> {
        validate_id(&self.workspace_id).map_err(|e| SandboxError::Setup(e.to_string()))?;
        let files_dir = self
            .store
            .files_dir(&self.workspace_id)
            .map_err(|e| SandboxError::Setup(e.to_string()))?;

        Ok(Sandbox {
            ctx: Arc::new(SandboxContext {
                files: FileArea::new(files_dir, self.policy),
                workspace_id: self.workspace_id,
                store: self.store,
                limits: self.limits,
                resolver: self.resolver,
                skills_dir: self.skills_dir,
                env_allowlist: self.env_allowlist,
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::panel::{PanelAction, extract_panel_updates};
    use crate::policy::{FilePolicyConfig, Policy, Preset};

    async fn sandbox(dir: &tempfile::TempDir) -> Sandbox {
        sandbox_with(dir, SandboxLimits::default()).await
    }

    async fn sandbox_with(dir: &tempfile::TempDir, limits: SandboxLimits) -> Sandbox {
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));
        store.create_workspace_with_id("ws", "Test", "").await.unwrap();
        Sandbox::builder("ws", store)
            .limits(limits)
            .resolver(Arc::new(StaticResolver::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_render_value_kinds() {
        let limits = SandboxLimits::default();

        let (text, outcome) = render(&ScriptResult::Returned(None), "", &[], &limits);
        assert_eq!(text, "(no return value)");
        assert_eq!(outcome, Outcome::Completed);

        let (text, _) = render(&ScriptResult::Returned(Some(json!("plain"))), "", &[], &limits);
        assert_eq!(text, "plain");

        let (text, _) = render(&ScriptResult::Returned(Some(json!({ "a": 1 }))), "hi\n", &[], &limits);
        assert_eq!(text, "Logs:\nhi\n\n{\n  \"a\": 1\n}");

        let (text, outcome) = render(&ScriptResult::Threw("TypeError: x".into()), "", &[], &limits);
        assert_eq!(text, "Error: TypeError: x");
        assert_eq!(outcome, Outcome::Failed);
    }

    #[test]
    fn test_render_distinguishes_timeouts() {
        let limits = SandboxLimits::default();
        let (script, _) = render(&ScriptResult::TimedOut(TimeoutKind::Script), "", &[], &limits);
        let (asynchronous, outcome) = render(&ScriptResult::TimedOut(TimeoutKind::Async), "", &[], &limits);

        assert_eq!(script, "Timeout: script exceeded the 30000 ms execution limit");
        assert_eq!(asynchronous, "Timeout: snippet did not complete within 120000 ms");
        assert_eq!(outcome, Outcome::TimedOut);
    }

    #[test]
    fn test_builder_rejects_bad_workspace_id() {
        let store = WorkspaceStore::new("/nonexistent", Duration::from_secs(1));
        assert!(Sandbox::builder("../etc", store).build().is_err());
    }

    #[tokio::test]
    async fn test_execute_returns_value() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox.execute("return [1, 2, 3].map(x => x * 2);").await.unwrap();
        assert_eq!(output.outcome, Outcome::Completed);
        assert_eq!(output.text, "[\n  2,\n  4,\n  6\n]");
    }

    #[tokio::test]
    async fn test_execute_reports_errors_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox
            .execute("console.log('step', 1); throw new Error('bad input');")
            .await
            .unwrap();
        assert_eq!(output.outcome, Outcome::Failed);
        assert_eq!(output.text, "Logs:\nstep 1\n\nError: bad input");
    }

    #[tokio::test]
    async fn test_capability_errors_are_catchable() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox
            .execute("try { await read('table:missing'); } catch (e) { return 'caught: ' + e.message; }")
            .await
            .unwrap();
        assert_eq!(output.text, "caught: not found: table missing");
    }

    #[tokio::test]
    async fn test_bridge_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox
            .execute("return [typeof __hostCall, typeof __hostSync, typeof setTable, typeof require];")
            .await
            .unwrap();
        let (text, _) = extract_panel_updates(&output.text);
        let kinds: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(kinds, json!(["undefined", "undefined", "function", "undefined"]));
    }

    #[tokio::test]
    async fn test_panel_updates_stream_and_embed() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;
        let queue = PanelUpdateQueue::new();

        let output = sandbox
            .execute_streaming(
                "for (let i = 0; i < 3; i++) { await setTable('t' + i, { data: [{ i }] }); } return 'done';",
                &queue,
            )
            .await
            .unwrap();

        assert_eq!(queue.drain_ready().len(), 3);
        assert_eq!(output.panel_updates.len(), 3);
        let (text, embedded) = extract_panel_updates(&output.text);
        assert_eq!(text, "done");
        assert_eq!(embedded, output.panel_updates);
        assert!(embedded.iter().all(|u| u.action == PanelAction::Add));
    }

    #[tokio::test]
    async fn test_script_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let limits = SandboxLimits {
            script_timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        };
        let sandbox = sandbox_with(&dir, limits).await;

        let output = sandbox.execute("while (true) {}").await.unwrap();
        assert_eq!(output.outcome, Outcome::TimedOut);
        assert!(output.text.starts_with("Timeout: script exceeded"));
    }

    #[tokio::test]
    async fn test_async_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let limits = SandboxLimits {
            async_timeout: Duration::from_millis(300),
            ..SandboxLimits::default()
        };
        let sandbox = sandbox_with(&dir, limits).await;

        let output = sandbox
            .execute("await new Promise(resolve => setTimeout(resolve, 10000)); return 'late';")
            .await
            .unwrap();
        assert_eq!(output.outcome, Outcome::TimedOut);
        assert!(output.text.starts_with("Timeout: snippet did not complete"));
    }

    #[tokio::test]
    async fn test_set_interval_throws() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox.execute("setInterval(() => {}, 10);").await.unwrap();
        assert_eq!(output.outcome, Outcome::Failed);
        assert!(output.text.contains("setInterval is not available"));
    }

    #[tokio::test]
    async fn test_web_globals() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox
            .execute(
                r#"
                const url = new URL('/a b?x=1&y=two', 'https://example.com');
                url.searchParams.set('x', '2');
                const bytes = new TextEncoder().encode('héllo');
                return {
                  href: url.href,
                  y: url.searchParams.get('y'),
                  bytes: bytes.length,
                  text: new TextDecoder().decode(bytes),
                  b64: atob(btoa('hi')),
                };
                "#,
            )
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output.text).unwrap();
        assert_eq!(value["href"], "https://example.com/a%20b?x=2&y=two");
        assert_eq!(value["y"], "two");
        assert_eq!(value["bytes"], 6);
        assert_eq!(value["text"], "héllo");
        assert_eq!(value["b64"], "hi");
    }

    #[tokio::test]
    async fn test_fetch_to_private_address_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(&dir).await;

        let output = sandbox
            .execute("try { await fetch('http://127.0.0.1:8080/'); return 'reached'; } catch (e) { return e.message; }")
            .await
            .unwrap();
        assert!(output.text.starts_with("blocked:"), "{}", output.text);
    }

    #[tokio::test]
    async fn test_policy_applies_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));
        store.create_workspace_with_id("ws", "Test", "").await.unwrap();
        let sandbox = Sandbox::builder("ws", store)
            .policy(Policy::from_config(&FilePolicyConfig::preset(Preset::ReadOnly)).unwrap())
            .build()
            .unwrap();

        let output = sandbox
            .execute("await write('x', 'file:notes.txt');")
            .await
            .unwrap();
        assert_eq!(output.outcome, Outcome::Failed);
        assert!(output.text.contains("permission denied"));
    }
}
