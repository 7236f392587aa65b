//! Drives one query: the model stream and the panel-update queue are merged
//! into a single client-facing stream, folded into a transcript, and
//! persisted.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::accumulator::StreamAccumulator;
use super::backend::{LlmBackend, LlmRequest, ProviderError};
use super::messages::{ContentPart, MessageContent, StreamMessage, ToolResultContent};
use super::tools::WorkspaceTools;
use crate::panel::{PanelUpdate, PanelUpdateQueue, extract_panel_updates};
use crate::sandbox::{RemoteExecutor, SandboxError, SandboxManager};
use crate::store::models::Message;
use crate::store::{StoreError, WorkspaceStore};

/// Buffer between the merge loop and the client.
const OUTPUT_BUFFER: usize = 64;

/// Errors that prevent a query from starting.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The model backend failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Reading or writing the workspace failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The workspace sandbox could not be created.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// One user turn against one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Target workspace.
    pub workspace_id: String,
    /// The user's prompt.
    pub prompt: String,
}

impl QueryRequest {
    /// Create a request.
    pub fn new(workspace_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            prompt: prompt.into(),
        }
    }
}

/// Runs queries against workspaces.
pub struct AgentRuntime {
    store: WorkspaceStore,
    backend: Arc<dyn LlmBackend>,
    sandboxes: Arc<SandboxManager>,
    python: Option<RemoteExecutor>,
    system_prompt: Option<String>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("sandboxes", &self.sandboxes)
            .field("has_python", &self.python.is_some())
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Create a runtime.
    pub fn new(store: WorkspaceStore, backend: Arc<dyn LlmBackend>, sandboxes: Arc<SandboxManager>) -> Self {
        Self {
            store,
            backend,
            sandboxes,
            python: None,
            system_prompt: None,
        }
    }

    /// Offer the remote `python` tool.
    pub fn with_python(mut self, executor: RemoteExecutor) -> Self {
        self.python = Some(executor);
        self
    }

    /// Set the system prompt sent with every query.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Start a query and return its event stream.
    ///
    /// The stream always ends with exactly one of `done`, `aborted` or
    /// `error`. Cancelling `cancel` stops further model requests; updates
    /// already produced are still delivered and the partial turn is saved
    /// as stopped.
    pub async fn query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamMessage>, RuntimeError> {
        let workspace_id = request.workspace_id;
        let workspace = self.store.get_workspace(&workspace_id).await?;
        let history = self.store.load_conversation(&workspace_id).await?.messages;
        let sandbox = self.sandboxes.get_or_create(&workspace_id)?;

        self.store
            .append_message(&workspace_id, Message::user(request.prompt.clone()))
            .await?;

        let queue = PanelUpdateQueue::new();
        let mut tools = WorkspaceTools::new(sandbox, queue.clone());
        if let Some(python) = &self.python {
            tools = tools.with_python(python.clone());
        }

        let llm = self.backend.stream(
            LlmRequest {
                system: join_prompts(self.system_prompt.as_deref(), workspace.system_prompt.as_deref()),
                history,
                prompt: request.prompt,
            },
            Arc::new(tools),
            cancel.clone(),
        );

        tracing::info!(workspace_id = %workspace_id, "query started");
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let merge = MergeLoop {
            store: self.store.clone(),
            workspace_id,
            queue,
            cancel,
            tx,
            accumulator: StreamAccumulator::new(),
            delivered: HashMap::new(),
        };
        tokio::spawn(merge.run(llm));
        Ok(rx)
    }
}

/// How the merge loop stopped.
#[derive(Debug)]
enum Ending {
    Completed,
    Cancelled,
    Failed(String),
}

struct MergeLoop {
    store: WorkspaceStore,
    workspace_id: String,
    queue: PanelUpdateQueue,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamMessage>,
    accumulator: StreamAccumulator,
    /// Serialized updates already sent through the queue, with counts, so
    /// the same updates found in tool-result markers are not sent twice.
    delivered: HashMap<String, usize>,
}

impl MergeLoop {
    async fn run(mut self, mut llm: mpsc::Receiver<Result<StreamMessage, ProviderError>>) {
        let mut queue_open = true;

        let ending = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ending::Cancelled,
                update = self.queue.next(), if queue_open => match update {
                    Some(update) => {
                        let mut batch = vec![update];
                        batch.extend(self.queue.drain_ready());
                        if !self.send_updates(batch, true).await {
                            break Ending::Cancelled;
                        }
                    }
                    None => queue_open = false,
                },
                item = llm.recv() => match item {
                    Some(Ok(message)) => {
                        let finished = matches!(message, StreamMessage::Result { .. });
                        if !self.forward(message).await {
                            break Ending::Cancelled;
                        }
                        if finished {
                            break Ending::Completed;
                        }
                    }
                    Some(Err(ProviderError::Cancelled)) => break Ending::Cancelled,
                    Some(Err(e)) => break Ending::Failed(e.to_string()),
                    None => {
                        tracing::warn!(workspace_id = %self.workspace_id, "model stream ended without a result");
                        break Ending::Completed;
                    }
                },
            }
        };

        if matches!(ending, Ending::Cancelled) {
            // The model may have sent more before the cancel was seen; keep it
            // so the stopped turn holds everything received.
            while let Ok(item) = llm.try_recv() {
                match item {
                    Ok(StreamMessage::Result { .. }) | Err(_) => {}
                    Ok(message) => {
                        self.forward(message).await;
                    }
                }
            }
        }

        // Nothing pushed from here on can be delivered; hand out what is buffered.
        self.queue.close();
        let rest = self.queue.drain_ready();
        if !rest.is_empty() {
            tracing::debug!(count = rest.len(), "draining panel updates after stream end");
            self.send_updates(rest, true).await;
        }

        self.finish(ending).await;
    }

    /// Forward one model message, routing tool results through the marker
    /// channel first.
    async fn forward(&mut self, message: StreamMessage) -> bool {
        let message = match message {
            StreamMessage::User { message } => {
                // Updates the sandbox queued while the tool ran precede its result.
                let ready = self.queue.drain_ready();
                if !ready.is_empty() {
                    self.send_updates(ready, true).await;
                }

                let (message, embedded) = strip_markers(message);
                let fresh = self.unseen(embedded);
                if !fresh.is_empty() {
                    self.send_updates(fresh, false).await;
                }
                StreamMessage::User { message }
            }
            other => other,
        };
        self.emit(message).await
    }

    /// Drop updates already delivered through the queue.
    fn unseen(&mut self, updates: Vec<PanelUpdate>) -> Vec<PanelUpdate> {
        updates
            .into_iter()
            .filter(|update| {
                let Some(key) = fingerprint(update) else {
                    return true;
                };
                match self.delivered.get_mut(&key) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        false
                    }
                    _ => true,
                }
            })
            .collect()
    }

    async fn send_updates(&mut self, updates: Vec<PanelUpdate>, from_queue: bool) -> bool {
        if from_queue {
            for update in &updates {
                if let Some(key) = fingerprint(update) {
                    *self.delivered.entry(key).or_default() += 1;
                }
            }
        }
        self.emit(StreamMessage::PanelUpdate { panel_updates: updates }).await
    }

    /// Fold `message` into the transcript and send it to the client.
    ///
    /// Returns false once the client has gone; the transcript still gets
    /// the message.
    async fn emit(&mut self, message: StreamMessage) -> bool {
        self.accumulator.ingest(&message);
        if self.tx.send(message).await.is_err() {
            if !self.cancel.is_cancelled() {
                tracing::info!(workspace_id = %self.workspace_id, "client went away; cancelling query");
                self.cancel.cancel();
            }
            return false;
        }
        true
    }

    async fn finish(mut self, ending: Ending) {
        let transcript = self.accumulator.finalize();
        let stopped = matches!(ending, Ending::Cancelled);

        let mut save_error = None;
        if !transcript.blocks.is_empty() || stopped {
            let mut message = Message::assistant(transcript.text, transcript.blocks);
            message.stopped = stopped;
            if let Err(e) = self.store.append_message(&self.workspace_id, message).await {
                tracing::error!(workspace_id = %self.workspace_id, error = %e, "failed to save assistant message");
                save_error = Some(e.to_string());
            }
        }

        let terminal = match (ending, save_error) {
            (Ending::Failed(error), _) => {
                tracing::warn!(workspace_id = %self.workspace_id, error = %error, "query failed");
                StreamMessage::Error { error }
            }
            (Ending::Cancelled, _) => {
                tracing::info!(workspace_id = %self.workspace_id, "query cancelled");
                StreamMessage::Aborted
            }
            (Ending::Completed, Some(error)) => StreamMessage::Error {
                error: format!("failed to save conversation: {error}"),
            },
            (Ending::Completed, None) => {
                tracing::info!(workspace_id = %self.workspace_id, "query finished");
                StreamMessage::Done
            }
        };
        if self.tx.send(terminal).await.is_err() {
            tracing::debug!(workspace_id = %self.workspace_id, "client gone before the terminal event");
        }
    }
}

/// Strip marker blocks from every tool result, collecting their updates.
fn strip_markers(mut message: MessageContent) -> (MessageContent, Vec<PanelUpdate>) {
    let mut updates = Vec::new();
    for part in &mut message.content {
        let ContentPart::ToolResult { content, .. } = part else {
            continue;
        };
        match content {
            ToolResultContent::Text(text) => {
                let (clean, found) = extract_panel_updates(text);
                *text = clean;
                updates.extend(found);
            }
            ToolResultContent::Parts(parts) => {
                for inner in parts {
                    if let ContentPart::Text { text } = inner {
                        let (clean, found) = extract_panel_updates(text);
                        *text = clean;
                        updates.extend(found);
                    }
                }
            }
        }
    }
    (message, updates)
}

/// The runtime prompt followed by the workspace's own instructions.
fn join_prompts(base: Option<&str>, workspace: Option<&str>) -> Option<String> {
    match (base, workspace.filter(|w| !w.trim().is_empty())) {
        (Some(base), Some(extra)) => Some(format!("{base}\n\n{extra}")),
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (None, None) => None,
    }
}

fn fingerprint(update: &PanelUpdate) -> Option<String> {
    serde_json::to_string(update).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::agent::tools::{ToolCall, ToolHandler};
    use crate::panel::embed_panel_updates;
    use crate::sandbox::Sandbox;
    use crate::store::models::{ContentBlock, Panel, PanelKind, Role, ToolStatus};

    /// Replays a fixed list of messages, calling the tool handler for every
    /// tool use it contains.
    struct Scripted {
        steps: Vec<Result<StreamMessage, String>>,
    }

    impl LlmBackend for Scripted {
        fn stream(
            &self,
            _request: LlmRequest,
            tools: Arc<dyn ToolHandler>,
            cancel: CancellationToken,
        ) -> mpsc::Receiver<Result<StreamMessage, ProviderError>> {
            let (tx, rx) = mpsc::channel(16);
            let steps = self.steps.clone();
            tokio::spawn(async move {
                for step in steps {
                    if cancel.is_cancelled() {
                        let _ = tx.send(Err(ProviderError::Cancelled)).await;
                        return;
                    }
                    let message = match step {
                        Ok(message) => message,
                        Err(e) => {
                            let _ = tx.send(Err(ProviderError::Other(e))).await;
                            return;
                        }
                    };
                    if let StreamMessage::Assistant { message: content } = &message {
                        let _ = tx.send(Ok(message.clone())).await;
                        let mut results = Vec::new();
                        for part in &content.content {
                            if let ContentPart::ToolUse { id, name, input } = part {
                                let output = tools
                                    .invoke(ToolCall {
                                        id: id.clone(),
                                        name: name.clone(),
                                        input: input.clone(),
                                    })
                                    .await;
                                results.push(ContentPart::ToolResult {
                                    tool_use_id: id.clone(),
                                    content: ToolResultContent::Text(output.content),
                                    is_error: output.is_error,
                                });
                            }
                        }
                        if !results.is_empty() {
                            let _ = tx.send(Ok(StreamMessage::user(results))).await;
                        }
                        continue;
                    }
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
            });
            rx
        }
    }

    fn execute(id: &str, code: &str) -> ContentPart {
        ContentPart::ToolUse {
            id: id.into(),
            name: "execute".into(),
            input: json!({ "code": code }),
        }
    }

    async fn runtime(dir: &tempfile::TempDir, steps: Vec<Result<StreamMessage, String>>) -> AgentRuntime {
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));
        store.create_workspace_with_id("ws", "Test", "").await.unwrap();
        let factory_store = store.clone();
        let sandboxes = Arc::new(SandboxManager::new(Duration::from_secs(60), move |id| {
            Sandbox::builder(id, factory_store.clone()).build()
        }));
        AgentRuntime::new(store, Arc::new(Scripted { steps }), sandboxes)
    }

    async fn collect(mut rx: mpsc::Receiver<StreamMessage>) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(message);
        }
        out
    }

    fn panel_updates(messages: &[StreamMessage]) -> Vec<PanelUpdate> {
        messages
            .iter()
            .filter_map(|m| match m {
                StreamMessage::PanelUpdate { panel_updates } => Some(panel_updates.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_updates_delivered_once_and_before_result() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(
            &dir,
            vec![
                Ok(StreamMessage::assistant(vec![execute(
                    "t1",
                    "for (let i = 0; i < 3; i++) { await setMarkdown('m' + i, 'x'); } return 'ok';",
                )])),
                Ok(StreamMessage::text_delta(0, "Done.")),
                Ok(StreamMessage::Result { stop_reason: None }),
            ],
        )
        .await;

        let messages = collect(
            runtime
                .query(QueryRequest::new("ws", "make panels"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;

        let ids: Vec<_> = panel_updates(&messages).into_iter().map(|u| u.panel.id).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
        assert_eq!(messages.last(), Some(&StreamMessage::Done));

        // The forwarded tool result no longer carries the marker block.
        let result_text = messages
            .iter()
            .find_map(|m| match m {
                StreamMessage::User { message } => match &message.content[0] {
                    ContentPart::ToolResult { content, .. } => Some(content.text()),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        assert_eq!(result_text, "ok");
    }

    #[tokio::test]
    async fn test_marker_only_updates_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let update = PanelUpdate::add(Panel::new("ext", PanelKind::Markdown { content: "hi".into() }), None);
        let text = embed_panel_updates("remote result", &[update]);
        let runtime = runtime(
            &dir,
            vec![
                Ok(StreamMessage::user(vec![ContentPart::ToolResult {
                    tool_use_id: "t1".into(),
                    content: ToolResultContent::Text(text),
                    is_error: false,
                }])),
                Ok(StreamMessage::Result { stop_reason: None }),
            ],
        )
        .await;

        let messages = collect(
            runtime
                .query(QueryRequest::new("ws", "go"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        let ids: Vec<_> = panel_updates(&messages).into_iter().map(|u| u.panel.id).collect();
        assert_eq!(ids, vec!["ext"]);
    }

    #[tokio::test]
    async fn test_transcript_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(
            &dir,
            vec![
                Ok(StreamMessage::text_delta(0, "Working.")),
                Ok(StreamMessage::assistant(vec![
                    ContentPart::Text { text: "Working.".into() },
                    execute("t1", "return 1 + 1"),
                ])),
                Ok(StreamMessage::Result {
                    stop_reason: Some("end_turn".into()),
                }),
            ],
        )
        .await;

        collect(
            runtime
                .query(QueryRequest::new("ws", "add"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;

        let conversation = runtime.store.load_conversation("ws").await.unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        let assistant = &conversation.messages[1];
        assert_eq!(assistant.content, "Working.");
        assert!(!assistant.stopped);
        let blocks = assistant.blocks.as_ref().unwrap();
        let ContentBlock::Tools { tools } = &blocks[1] else {
            panic!("expected tool group, got {blocks:?}");
        };
        assert_eq!(tools[0].status, ToolStatus::Success);
        assert_eq!(tools[0].output.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_provider_error_persists_partial_turn() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(
            &dir,
            vec![Ok(StreamMessage::text_delta(0, "Half")), Err("overloaded".into())],
        )
        .await;

        let messages = collect(
            runtime
                .query(QueryRequest::new("ws", "hi"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(
            messages.last(),
            Some(&StreamMessage::Error {
                error: "overloaded".into()
            })
        );

        let conversation = runtime.store.load_conversation("ws").await.unwrap();
        assert_eq!(conversation.messages[1].content, "Half");
    }

    #[tokio::test]
    async fn test_cancel_marks_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(&dir, vec![]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let messages = collect(runtime.query(QueryRequest::new("ws", "hi"), cancel).await.unwrap()).await;
        assert_eq!(messages, vec![StreamMessage::Aborted]);

        let conversation = runtime.store.load_conversation("ws").await.unwrap();
        assert!(conversation.messages[1].stopped);
    }

    /// Queues every message before handing the stream over.
    struct Prefilled {
        messages: Vec<StreamMessage>,
    }

    impl LlmBackend for Prefilled {
        fn stream(
            &self,
            _request: LlmRequest,
            _tools: Arc<dyn ToolHandler>,
            _cancel: CancellationToken,
        ) -> mpsc::Receiver<Result<StreamMessage, ProviderError>> {
            let (tx, rx) = mpsc::channel(16);
            for message in &self.messages {
                tx.try_send(Ok(message.clone())).unwrap();
            }
            rx
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_already_received_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));
        store.create_workspace_with_id("ws", "Test", "").await.unwrap();
        let factory_store = store.clone();
        let sandboxes = Arc::new(SandboxManager::new(Duration::from_secs(60), move |id| {
            Sandbox::builder(id, factory_store.clone()).build()
        }));
        let backend = Prefilled {
            messages: vec![
                StreamMessage::text_delta(0, "Partial "),
                StreamMessage::text_delta(0, "answer"),
                StreamMessage::Result { stop_reason: None },
            ],
        };
        let runtime = AgentRuntime::new(store, Arc::new(backend), sandboxes);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let messages = collect(runtime.query(QueryRequest::new("ws", "hi"), cancel).await.unwrap()).await;
        assert_eq!(messages.last(), Some(&StreamMessage::Aborted));
        assert!(!messages.iter().any(|m| matches!(m, StreamMessage::Result { .. })));

        let conversation = runtime.store.load_conversation("ws").await.unwrap();
        let assistant = &conversation.messages[1];
        assert!(assistant.stopped);
        assert_eq!(assistant.content, "Partial answer");
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(&dir, vec![]).await;
        let err = runtime
            .query(QueryRequest::new("missing", "hi"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Store(StoreError::NotFound(_))));
    }
}
