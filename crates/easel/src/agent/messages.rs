//! Transport framing for the agent event stream.
//!
//! Every item is one JSON object discriminated by `type`. The shapes follow
//! the Anthropic streaming format closely enough that provider events can
//! be forwarded as-is, plus a few runtime-level markers (`panel_update`,
//! `done`, `aborted`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::panel::PanelUpdate;

/// One item in the merged stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Incremental provider event.
    StreamEvent {
        /// The event.
        event: StreamEvent,
    },
    /// A complete model turn.
    Assistant {
        /// Turn content.
        message: MessageContent,
    },
    /// Tool results fed back to the model.
    User {
        /// Turn content.
        message: MessageContent,
    },
    /// Panel mutations produced by sandboxed code.
    PanelUpdate {
        /// Updates in production order.
        #[serde(rename = "panelUpdates")]
        panel_updates: Vec<PanelUpdate>,
    },
    /// Terminal failure.
    Error {
        /// Human-readable description.
        error: String,
    },
    /// The provider finished the conversation turn.
    Result {
        /// Why the provider stopped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
    /// The stream completed normally.
    Done,
    /// The stream was cancelled.
    Aborted,
    /// Any type this build does not know.
    #[serde(other)]
    Unknown,
}

impl StreamMessage {
    /// A `stream_event` carrying a text delta.
    pub fn text_delta(index: usize, text: impl Into<String>) -> Self {
        StreamMessage::StreamEvent {
            event: StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta { text: text.into() },
            },
        }
    }

    /// A `stream_event` announcing a tool call.
    pub fn tool_use_start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        StreamMessage::StreamEvent {
            event: StreamEvent::ContentBlockStart {
                index,
                content_block: ContentPart::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input: Value::Object(Default::default()),
                },
            },
        }
    }

    /// A complete assistant turn.
    pub fn assistant(content: Vec<ContentPart>) -> Self {
        StreamMessage::Assistant {
            message: MessageContent { content },
        }
    }

    /// A user turn carrying tool results.
    pub fn user(content: Vec<ContentPart>) -> Self {
        StreamMessage::User {
            message: MessageContent { content },
        }
    }

    /// Whether nothing may follow this message.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamMessage::Error { .. } | StreamMessage::Done | StreamMessage::Aborted
        )
    }
}

/// Incremental provider events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A content block opened.
    ContentBlockStart {
        /// Block position within the turn.
        #[serde(default)]
        index: usize,
        /// Initial block content.
        content_block: ContentPart,
    },
    /// A content block grew.
    ContentBlockDelta {
        /// Block position within the turn.
        #[serde(default)]
        index: usize,
        /// The increment.
        delta: Delta,
    },
    /// Any event the accumulator ignores.
    #[serde(other)]
    Other,
}

/// Content block increments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    /// More prose.
    TextDelta {
        /// Appended text.
        text: String,
    },
    /// More tool input JSON.
    InputJsonDelta {
        /// Appended JSON fragment.
        partial_json: String,
    },
    /// Any delta the accumulator ignores.
    #[serde(other)]
    Other,
}

/// The `message` of an `assistant` or `user` item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Typed blocks.
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// A typed block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Prose.
    Text {
        /// The text.
        text: String,
    },
    /// A tool invocation.
    ToolUse {
        /// Provider-issued call ID.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        #[serde(default)]
        input: Value,
    },
    /// The outcome of a tool invocation.
    ToolResult {
        /// ID of the `tool_use` this answers.
        tool_use_id: String,
        /// Result payload.
        content: ToolResultContent,
        /// Whether the tool failed.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Any block type the runtime ignores.
    #[serde(other)]
    Other,
}

/// A tool result is either plain text or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Plain text.
    Text(String),
    /// Segmented content.
    Parts(Vec<ContentPart>),
}

impl ToolResultContent {
    /// The textual content, segments joined by newlines.
    pub fn text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parses_stream_event() {
        let raw = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "Hel" }
            }
        });
        let message: StreamMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message, StreamMessage::text_delta(0, "Hel"));
    }

    #[test]
    fn test_parses_tool_result_forms() {
        let raw = json!({
            "type": "user",
            "message": { "content": [
                { "type": "tool_result", "tool_use_id": "t1", "content": "plain" },
                { "type": "tool_result", "tool_use_id": "t2", "is_error": true,
                  "content": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }] }
            ]}
        });
        let StreamMessage::User { message } = serde_json::from_value(raw).unwrap() else {
            panic!("expected user message");
        };
        let texts: Vec<_> = message
            .content
            .iter()
            .map(|part| match part {
                ContentPart::ToolResult { content, is_error, .. } => (content.text(), *is_error),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec![("plain".to_string(), false), ("a\nb".to_string(), true)]);
    }

    #[test]
    fn test_panel_update_uses_camel_case_key() {
        let message = StreamMessage::PanelUpdate { panel_updates: vec![] };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "type": "panel_update", "panelUpdates": [] })
        );
    }

    #[test]
    fn test_unknown_types_are_tolerated() {
        let message: StreamMessage = serde_json::from_value(json!({ "type": "ping" })).unwrap();
        assert_eq!(message, StreamMessage::Unknown);

        let event: StreamEvent =
            serde_json::from_value(json!({ "type": "message_delta", "delta": {} })).unwrap();
        assert_eq!(event, StreamEvent::Other);
    }

    #[test]
    fn test_terminal_markers() {
        assert!(StreamMessage::Done.is_terminal());
        assert!(StreamMessage::Aborted.is_terminal());
        assert!(!StreamMessage::Result { stop_reason: None }.is_terminal());
    }
}
