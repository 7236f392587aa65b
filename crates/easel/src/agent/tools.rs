//! Tools offered to the model.
//!
//! The runtime exposes two: `execute`, which runs a JavaScript snippet in
//! the workspace sandbox and streams its panel updates, and `python`, which
//! forwards code to the external execution service when one is configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::panel::PanelUpdateQueue;
use crate::sandbox::{RemoteExecutor, Sandbox};

/// A tool's schema as sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique identifier).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input.
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Provider-issued call ID.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool input.
    pub input: Value,
}

/// What a tool hands back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Result text.
    pub content: String,
    /// Whether the call failed.
    pub is_error: bool,
}

impl ToolOutput {
    /// A successful result.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// A failed result.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Handler for model tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Schemas of the tools this handler serves.
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    /// Run one call.
    async fn invoke(&self, call: ToolCall) -> ToolOutput;
}

/// Blanket implementation for async closures.
///
/// ```rust
/// use easel::agent::{ToolCall, ToolHandler, ToolOutput};
///
/// let handler = |call: ToolCall| async move { ToolOutput::ok(format!("got {}", call.name)) };
/// # fn assert_handler(_: &impl ToolHandler) {}
/// # assert_handler(&handler);
/// ```
#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ToolOutput> + Send,
{
    async fn invoke(&self, call: ToolCall) -> ToolOutput {
        self(call).await
    }
}

/// Name of the JavaScript sandbox tool.
pub const EXECUTE_TOOL: &str = "execute";
/// Name of the remote Python tool.
pub const PYTHON_TOOL: &str = "python";

#[derive(Deserialize)]
struct CodeInput {
    code: String,
    #[serde(default)]
    timeout: Option<u64>,
}

/// The `execute` and `python` tools for one workspace and one query.
pub struct WorkspaceTools {
    sandbox: Arc<Sandbox>,
    queue: PanelUpdateQueue,
    python: Option<RemoteExecutor>,
}

impl std::fmt::Debug for WorkspaceTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceTools")
            .field("workspace_id", &self.sandbox.workspace_id())
            .field("has_python", &self.python.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkspaceTools {
    /// Tools backed by `sandbox`, streaming panel updates into `queue`.
    pub fn new(sandbox: Arc<Sandbox>, queue: PanelUpdateQueue) -> Self {
        Self {
            sandbox,
            queue,
            python: None,
        }
    }

    /// Also offer the `python` tool.
    pub fn with_python(mut self, executor: RemoteExecutor) -> Self {
        self.python = Some(executor);
        self
    }

    async fn execute(&self, input: CodeInput) -> ToolOutput {
        match self.sandbox.execute_streaming(&input.code, &self.queue).await {
            Ok(output) if output.is_success() => ToolOutput::ok(output.text),
            Ok(output) => ToolOutput::error(output.text),
            Err(e) => ToolOutput::error(format!("Error: {e}")),
        }
    }

    async fn python(&self, executor: &RemoteExecutor, input: CodeInput) -> ToolOutput {
        let timeout = input
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(RemoteExecutor::DEFAULT_TIMEOUT);
        match executor
            .execute(self.sandbox.workspace_id(), &input.code, timeout)
            .await
        {
            Ok(result) if result.success => ToolOutput::ok(result.to_text()),
            Ok(result) => ToolOutput::error(result.to_text()),
            Err(e) => ToolOutput::error(format!("Error: {e}")),
        }
    }
}

#[async_trait]
impl ToolHandler for WorkspaceTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut tools = vec![ToolDefinition::new(
            EXECUTE_TOOL,
            "Run JavaScript in the workspace sandbox. The body may use top-level await and \
             return a value. Capabilities: read/write (table:, chart:, cards:, markdown:, file: \
             addresses), setTable/setChart/setCards/setMarkdown/setPdf, addPanel/removePanel/\
             updatePanel/movePanel, filter/pick/sort/map/unique/group, fetch, listSkills/\
             readSkill, env, download, log, setWorkspaceInfo, glob/search/edit/listFiles/\
             deleteFile, getFilePath/getWorkspaceDir.",
            json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "JavaScript snippet body" }
                },
                "required": ["code"]
            }),
        )];
        if self.python.is_some() {
            tools.push(ToolDefinition::new(
                PYTHON_TOOL,
                "Run Python in a persistent per-workspace session with pandas, numpy, \
                 matplotlib and openpyxl available. Use it for spreadsheets and heavy analysis.",
                json!({
                    "type": "object",
                    "properties": {
                        "code": { "type": "string", "description": "Python source" },
                        "timeout": { "type": "integer", "description": "Seconds, default 60" }
                    },
                    "required": ["code"]
                }),
            ));
        }
        tools
    }

    async fn invoke(&self, call: ToolCall) -> ToolOutput {
        let input: CodeInput = match serde_json::from_value(call.input) {
            Ok(input) => input,
            Err(e) => return ToolOutput::error(format!("Error: invalid input for {}: {e}", call.name)),
        };

        match (call.name.as_str(), &self.python) {
            (EXECUTE_TOOL, _) => self.execute(input).await,
            (PYTHON_TOOL, Some(executor)) => self.python(executor, input).await,
            (other, _) => ToolOutput::error(format!("Error: unknown tool {other}")),
        }
    }
}
