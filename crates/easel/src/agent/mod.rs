//! Agent runtime: one model conversation per query, merged with the panel
//! updates its tool calls produce.
//!
//! # Stream shape
//!
//! ```text
//! model (LlmBackend) ──► stream_event / assistant / user / result ──┐
//!                                                                   ├─► merge loop ──► client
//! sandbox (execute tool) ──► PanelUpdateQueue ──► panel_update ─────┘        │
//!                                                                            ▼
//!                                                          StreamAccumulator ─► conversation.json
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use easel::agent::{AgentRuntime, AnthropicBackend, QueryRequest};
//! use easel::sandbox::SandboxManager;
//! use tokio_util::sync::CancellationToken;
//!
//! let backend = AnthropicBackend::from_env(config.anthropic.clone())?;
//! let sandboxes = Arc::new(SandboxManager::from_config(store.clone(), &config)?);
//! let runtime = AgentRuntime::new(store, Arc::new(backend), sandboxes);
//!
//! let mut events = runtime
//!     .query(QueryRequest::new("ws-1", "Chart last week's signups"), CancellationToken::new())
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

mod accumulator;
mod anthropic;
mod backend;
mod messages;
mod runtime;
mod tools;

pub use accumulator::{StreamAccumulator, Transcript};
pub use anthropic::AnthropicBackend;
pub use backend::{LlmBackend, LlmRequest, ProviderError};
pub use messages::{ContentPart, Delta, MessageContent, StreamEvent, StreamMessage, ToolResultContent};
pub use runtime::{AgentRuntime, QueryRequest, RuntimeError};
pub use tools::{EXECUTE_TOOL, PYTHON_TOOL, ToolCall, ToolDefinition, ToolHandler, ToolOutput, WorkspaceTools};
