//! Easel MCP Server
//!
//! Exposes the workspace JavaScript sandbox as an MCP `execute` tool. MCP
//! clients cannot read the panel-update queue, so updates travel inside the
//! tool result text between the panel-update markers.

use std::sync::Arc;

use easel::sandbox::SandboxManager;
use easel::{EaselConfig, WorkspaceStore};
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
};
use serde::{Deserialize, Serialize};

/// Parameters for the execute tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// JavaScript snippet body. May use top-level `await` and `return` a value.
    pub code: String,

    /// Workspace to run against (default: the server's workspace)
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// MCP server running snippets in workspace sandboxes
#[derive(Clone)]
pub struct EaselServer {
    sandboxes: Arc<SandboxManager>,
    default_workspace: String,
}

impl std::fmt::Debug for EaselServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EaselServer")
            .field("default_workspace", &self.default_workspace)
            .finish_non_exhaustive()
    }
}

impl EaselServer {
    /// Create a server over the store described by `config`, making sure
    /// `default_workspace` exists.
    pub async fn new(config: &EaselConfig, default_workspace: impl Into<String>) -> anyhow::Result<Self> {
        let default_workspace = default_workspace.into();
        let store = WorkspaceStore::new(&config.data_dir, config.lock_timeout);
        match store.get_workspace(&default_workspace).await {
            Ok(_) => {}
            Err(easel::StoreError::NotFound(_)) => {
                store
                    .create_workspace_with_id(&default_workspace, &default_workspace, "")
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        let sandboxes = Arc::new(SandboxManager::from_config(store, config)?);
        sandboxes.start();
        Ok(Self {
            sandboxes,
            default_workspace,
        })
    }

    /// Run a snippet and render its output for the model.
    async fn execute_code(&self, params: ExecuteParams) -> Result<CallToolResult, McpError> {
        let workspace_id = params.workspace_id.as_deref().unwrap_or(&self.default_workspace);
        let sandbox = self
            .sandboxes
            .get_or_create(workspace_id)
            .map_err(|e| McpError::invalid_params(format!("Invalid workspace: {}", e), None))?;

        let output = sandbox
            .execute(&params.code)
            .await
            .map_err(|e| McpError::internal_error(format!("Execution error: {}", e), None))?;

        let content = vec![Content::text(output.text.clone())];
        if output.is_success() {
            Ok(CallToolResult::success(content))
        } else {
            Ok(CallToolResult::error(content))
        }
    }

    fn execute_tool(&self) -> Tool {
        let schema = schemars::schema_for!(ExecuteParams);
        let schema_json = serde_json::to_value(schema).unwrap_or_default();
        let input_schema = match schema_json {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: "execute".into(),
            title: Some("Execute JavaScript".into()),
            description: Some(
                "Run JavaScript against a canvas workspace. The snippet may read and write \
                tables, charts, cards and markdown, manage panels, work with workspace files, \
                and fetch public URLs. Panel changes are reported at the end of the result \
                between <<<PANEL_UPDATES>>> markers."
                    .into(),
            ),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for EaselServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Easel runs JavaScript snippets in a capability sandbox bound to a canvas \
                workspace. Use the 'execute' tool; return a value to see it in the result."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: vec![self.execute_tool()],
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "execute" => {
                let params: ExecuteParams = match &request.arguments {
                    Some(args) => serde_json::from_value(serde_json::Value::Object(args.clone()))
                        .map_err(|e| {
                        McpError::invalid_params(format!("Invalid parameters: {}", e), None)
                    })?,
                    None => {
                        return Err(McpError::invalid_params("Missing 'code' parameter", None));
                    }
                };
                self.execute_code(params).await
            }
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_params_defaults() {
        let json = r#"{"code": "return 1"}"#;
        let params: ExecuteParams = serde_json::from_str(json).expect("parse failed");
        assert_eq!(params.code, "return 1");
        assert!(params.workspace_id.is_none());
    }

    #[tokio::test]
    async fn test_new_creates_default_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EaselConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let server = EaselServer::new(&config, "scratch").await.expect("server");
        let result = server
            .execute_code(ExecuteParams {
                code: "return 6 * 7".into(),
                workspace_id: None,
            })
            .await
            .expect("execute");
        assert_eq!(result.is_error, Some(false));

        // A second server over the same store reuses the workspace.
        EaselServer::new(&config, "scratch").await.expect("reopen");
    }
}
