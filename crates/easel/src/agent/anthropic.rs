//! Anthropic Messages API backend.
//!
//! Streams each model turn over server-sent events, forwards block starts
//! and deltas as `stream_event`s, emits the complete `assistant` message at
//! the end of the turn, and runs requested tools before the next turn.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{LlmBackend, LlmRequest, ProviderError};
use super::messages::{ContentPart, Delta, StreamEvent, StreamMessage, ToolResultContent};
use super::tools::{ToolCall, ToolDefinition, ToolHandler};
use crate::config::AnthropicConfig;
use crate::store::models::{Message, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming client for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    config: AnthropicConfig,
    api_key: String,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl AnthropicBackend {
    /// Create a backend with an explicit API key.
    pub fn new(config: AnthropicConfig, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            config,
            api_key: api_key.into(),
        }
    }

    /// Create a backend reading the key from `config.api_key_env`.
    pub fn from_env(config: AnthropicConfig) -> Result<Self, ProviderError> {
        let key = std::env::var(&config.api_key_env)
            .map_err(|_| ProviderError::Other(format!("{} is not set", config.api_key_env)))?;
        Ok(Self::new(config, key))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    async fn send(&self, body: &ApiRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            message: error_message(&text),
        })
    }

    async fn converse(
        &self,
        request: LlmRequest,
        tools: Arc<dyn ToolHandler>,
        cancel: CancellationToken,
        tx: &mpsc::Sender<Result<StreamMessage, ProviderError>>,
    ) -> Result<(), ProviderError> {
        let definitions = tools.definitions();
        let mut messages = history_to_api(&request.history);
        push_turn(&mut messages, "user", json!(request.prompt));

        for turn in 0..self.config.max_turns {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let body = ApiRequest {
                model: &self.config.model,
                max_tokens: self.config.max_tokens,
                system: request.system.as_deref(),
                messages: &messages,
                tools: &definitions,
                stream: true,
            };
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                response = self.send(&body) => response?,
            };

            let Some(turn_result) = read_turn(response, &cancel, tx).await? else {
                return Ok(());
            };
            let parts = turn_result.parts();
            if tx.send(Ok(StreamMessage::assistant(parts.clone()))).await.is_err() {
                return Ok(());
            }
            messages.push(json!({ "role": "assistant", "content": parts }));

            let calls: Vec<ToolCall> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ToolUse { id, name, input } => Some(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }),
                    _ => None,
                })
                .collect();

            if calls.is_empty() || turn_result.stop_reason.as_deref() != Some("tool_use") {
                let _ = tx
                    .send(Ok(StreamMessage::Result {
                        stop_reason: turn_result.stop_reason,
                    }))
                    .await;
                return Ok(());
            }

            tracing::debug!(turn, tools = calls.len(), "running tool calls");
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let tool_use_id = call.id.clone();
                let output = tools.invoke(call).await;
                results.push(ContentPart::ToolResult {
                    tool_use_id,
                    content: ToolResultContent::Text(output.content),
                    is_error: output.is_error,
                });
            }
            if tx.send(Ok(StreamMessage::user(results.clone()))).await.is_err() {
                return Ok(());
            }
            messages.push(json!({ "role": "user", "content": results }));
        }

        tracing::warn!(max_turns = self.config.max_turns, "tool loop hit the turn limit");
        let _ = tx
            .send(Ok(StreamMessage::Result {
                stop_reason: Some("max_turns".to_string()),
            }))
            .await;
        Ok(())
    }
}

impl LlmBackend for AnthropicBackend {
    fn stream(
        &self,
        request: LlmRequest,
        tools: Arc<dyn ToolHandler>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<StreamMessage, ProviderError>> {
        let (tx, rx) = mpsc::channel(64);
        let backend = self.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.converse(request, tools, cancel, &tx).await {
                tracing::warn!(error = %e, "anthropic stream failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Value],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [ToolDefinition],
    stream: bool,
}

/// Server-sent event payloads, discriminated by their `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiEvent {
    ContentBlockStart {
        index: usize,
        content_block: ContentPart,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
    },
    MessageStop,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
enum BlockState {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Everything learned from one streamed model turn.
#[derive(Debug, Default)]
struct TurnState {
    blocks: BTreeMap<usize, BlockState>,
    stop_reason: Option<String>,
    finished: bool,
}

impl TurnState {
    /// Apply one event, returning what should be forwarded downstream.
    fn apply(&mut self, event: ApiEvent) -> Result<Option<StreamMessage>, ProviderError> {
        match event {
            ApiEvent::ContentBlockStart { index, content_block } => {
                match &content_block {
                    ContentPart::Text { text } => {
                        self.blocks.insert(index, BlockState::Text(text.clone()));
                    }
                    ContentPart::ToolUse { id, name, .. } => {
                        self.blocks.insert(
                            index,
                            BlockState::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                json: String::new(),
                            },
                        );
                    }
                    _ => {}
                }
                Ok(Some(StreamMessage::StreamEvent {
                    event: StreamEvent::ContentBlockStart { index, content_block },
                }))
            }
            ApiEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(&index), &delta) {
                    (Some(BlockState::Text(buf)), Delta::TextDelta { text }) => buf.push_str(text),
                    (Some(BlockState::ToolUse { json, .. }), Delta::InputJsonDelta { partial_json }) => {
                        json.push_str(partial_json)
                    }
                    _ => {}
                }
                Ok(Some(StreamMessage::StreamEvent {
                    event: StreamEvent::ContentBlockDelta { index, delta },
                }))
            }
            ApiEvent::MessageDelta { delta } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                Ok(None)
            }
            ApiEvent::MessageStop => {
                self.finished = true;
                Ok(None)
            }
            ApiEvent::Error { error } => Err(ProviderError::Other(error.message)),
            ApiEvent::Other => Ok(None),
        }
    }

    /// The complete content of the turn, in block order.
    fn parts(&self) -> Vec<ContentPart> {
        self.blocks
            .values()
            .filter_map(|block| match block {
                BlockState::Text(text) if text.is_empty() => None,
                BlockState::Text(text) => Some(ContentPart::Text { text: text.clone() }),
                BlockState::ToolUse { id, name, json } => Some(ContentPart::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: if json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(json).unwrap_or_else(|e| {
                            tracing::warn!(tool_use_id = %id, error = %e, "tool input is not valid JSON");
                            Value::Object(Default::default())
                        })
                    },
                }),
            })
            .collect()
    }
}

/// Incremental `data:` line splitter for an SSE body.
///
/// Bytes are held until a full line arrives, so a UTF-8 sequence split
/// across chunks is decoded whole.
#[derive(Debug, Default)]
struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    /// Feed bytes and return every complete `data:` payload.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(data) = line.trim_end().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() && data != "[DONE]" {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Stream one turn. `Ok(None)` means the receiver went away.
async fn read_turn(
    response: reqwest::Response,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<StreamMessage, ProviderError>>,
) -> Result<Option<TurnState>, ProviderError> {
    let mut stream = response.bytes_stream();
    let mut sse = SseBuffer::default();
    let mut turn = TurnState::default();

    while !turn.finished {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        for data in sse.push(&chunk?) {
            let event: ApiEvent = match serde_json::from_str(&data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable SSE payload");
                    continue;
                }
            };
            if let Some(message) = turn.apply(event)?
                && tx.send(Ok(message)).await.is_err()
            {
                return Ok(None);
            }
        }
    }

    if !turn.finished {
        tracing::warn!("SSE stream ended without message_stop");
    }
    Ok(Some(turn))
}

/// Convert stored history to API messages. Consecutive turns from the same
/// role are merged, since the API requires alternation.
fn history_to_api(history: &[Message]) -> Vec<Value> {
    let mut messages = Vec::new();
    for message in history {
        if message.content.trim().is_empty() {
            continue;
        }
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        push_turn(&mut messages, role, json!(message.content));
    }
    // The conversation must open with a user turn.
    while messages.first().is_some_and(|m| m["role"] == "assistant") {
        messages.remove(0);
    }
    messages
}

fn push_turn(messages: &mut Vec<Value>, role: &str, content: Value) {
    if let Some(last) = messages.last_mut()
        && last["role"] == role
        && let (Some(prev), Some(next)) = (last["content"].as_str(), content.as_str())
    {
        last["content"] = json!(format!("{prev}\n\n{next}"));
        return;
    }
    messages.push(json!({ "role": role, "content": content }));
}

/// Pull the human-readable message out of an API error body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = value["error"]["message"].as_str()
    {
        return message.to_string();
    }
    if body.len() > 200 {
        let mut end = 200;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::agent::tools::ToolOutput;

    fn event(data: &str) -> ApiEvent {
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn test_sse_buffer_splits_across_chunks() {
        let mut sse = SseBuffer::default();
        assert!(sse.push(b"event: ping\ndata: {\"type\"").is_empty());
        let payloads = sse.push(b":\"ping\"}\n\ndata: [DONE]\n");
        assert_eq!(payloads, vec![r#"{"type":"ping"}"#.to_string()]);
    }

    #[test]
    fn test_sse_buffer_keeps_multibyte_split_across_chunks() {
        let mut sse = SseBuffer::default();
        assert!(sse.push(b"data: {\"t\":\"caf\xc3").is_empty());
        let payloads = sse.push(b"\xa9\"}\n");
        assert_eq!(payloads, vec!["{\"t\":\"café\"}".to_string()]);
    }

    #[test]
    fn test_turn_state_assembles_tool_input() {
        let mut turn = TurnState::default();
        turn.apply(event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        ))
        .unwrap();
        turn.apply(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking."}}"#,
        ))
        .unwrap();
        turn.apply(event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"execute","input":{}}}"#,
        ))
        .unwrap();
        for fragment in [r#"{\"code\":"#, r#"\"return 1\"}"#] {
            turn.apply(event(&format!(
                r#"{{"type":"content_block_delta","index":1,"delta":{{"type":"input_json_delta","partial_json":"{fragment}"}}}}"#
            )))
            .unwrap();
        }
        turn.apply(event(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#))
            .unwrap();
        turn.apply(event(r#"{"type":"message_stop"}"#)).unwrap();

        assert!(turn.finished);
        assert_eq!(turn.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(
            turn.parts(),
            vec![
                ContentPart::Text { text: "Checking.".into() },
                ContentPart::ToolUse {
                    id: "t1".into(),
                    name: "execute".into(),
                    input: json!({ "code": "return 1" }),
                },
            ]
        );
    }

    #[test]
    fn test_error_event_fails_turn() {
        let mut turn = TurnState::default();
        let err = turn
            .apply(event(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#))
            .unwrap_err();
        assert_eq!(err.to_string(), "Overloaded");
    }

    #[test]
    fn test_history_alternates() {
        let history = vec![
            Message::assistant("orphan", vec![]),
            Message::user("a"),
            Message::user("b"),
            Message::assistant("c", vec![]),
        ];
        let messages = history_to_api(&history);
        assert_eq!(
            messages,
            vec![
                json!({ "role": "user", "content": "a\n\nb" }),
                json!({ "role": "assistant", "content": "c" }),
            ]
        );
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#),
            "bad"
        );
        assert_eq!(error_message("plain"), "plain");
    }

    /// Serve canned SSE bodies, one per connection.
    async fn serve(bodies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 8192];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let length = text[..head_end]
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if request.len() >= head_end + 4 + length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        format!("http://{addr}")
    }

    const TOOL_TURN: &str = concat!(
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"execute\",\"input\":{}}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"code\\\":\\\"return 2\\\"}\"}}\n\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"}}\n\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    const TEXT_TURN: &str = concat!(
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"It is 2.\"}}\n\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    #[tokio::test]
    async fn test_tool_loop() {
        let base_url = serve(vec![TOOL_TURN, TEXT_TURN]).await;
        let backend = AnthropicBackend::new(
            AnthropicConfig {
                base_url,
                ..Default::default()
            },
            "test-key",
        );
        let tools: Arc<dyn ToolHandler> =
            Arc::new(|call: ToolCall| async move { ToolOutput::ok(format!("ran {}", call.input["code"])) });

        let mut rx = backend.stream(LlmRequest::new("what is 1+1?"), tools, CancellationToken::new());
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message.unwrap());
        }

        let results: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                StreamMessage::User { message } => Some(message.content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![vec![ContentPart::ToolResult {
                tool_use_id: "t1".into(),
                content: ToolResultContent::Text("ran \"return 2\"".into()),
                is_error: false,
            }]]
        );
        assert_eq!(
            messages.last(),
            Some(&StreamMessage::Result {
                stop_reason: Some("end_turn".into())
            })
        );
        assert!(messages.contains(&StreamMessage::text_delta(0, "It is 2.")));
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let backend = AnthropicBackend::new(AnthropicConfig::default(), "test-key");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tools: Arc<dyn ToolHandler> = Arc::new(|_call: ToolCall| async { ToolOutput::ok("") });

        let mut rx = backend.stream(LlmRequest::new("hi"), tools, cancel);
        assert!(matches!(rx.recv().await, Some(Err(ProviderError::Cancelled))));
        assert!(rx.recv().await.is_none());
    }
}
