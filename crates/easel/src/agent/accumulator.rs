//! Folds the merged event stream into a persisted transcript entry.
//!
//! Providers describe the same content twice: incrementally through
//! `stream_event`s and again in the complete `assistant` message. The
//! accumulator keeps one record per tool call ID and only takes text from
//! the complete message when no deltas were seen for that turn.

use std::collections::HashMap;

use super::messages::{ContentPart, Delta, StreamEvent, StreamMessage};
use crate::store::models::{ContentBlock, ToolExecution, ToolStatus};

/// A finished block; tool groups point into the tool arena.
#[derive(Debug, Clone)]
enum Block {
    Text(String),
    Tools(Vec<usize>),
}

/// The folded transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// All prose, blocks separated by blank lines.
    pub text: String,
    /// Prose and tool groups in order.
    pub blocks: Vec<ContentBlock>,
}

/// Incremental transcript builder. See the module docs.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    blocks: Vec<Block>,
    text: String,
    group: Vec<usize>,
    tools: Vec<ToolExecution>,
    by_id: HashMap<String, usize>,
    saw_stream_text: bool,
    finalized: Option<Transcript>,
}

impl StreamAccumulator {
    /// An empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message. Messages after [`finalize`](Self::finalize) are
    /// ignored.
    pub fn ingest(&mut self, message: &StreamMessage) {
        if self.finalized.is_some() {
            tracing::debug!("ignoring message after finalize");
            return;
        }

        match message {
            StreamMessage::StreamEvent { event } => self.ingest_event(event),
            StreamMessage::Assistant { message } => {
                for part in &message.content {
                    match part {
                        ContentPart::Text { text } if !self.saw_stream_text => self.push_text(text),
                        ContentPart::ToolUse { id, name, input } => self.upsert_tool(id, name, input),
                        _ => {}
                    }
                }
                // The complete message closes the turn.
                self.saw_stream_text = false;
            }
            StreamMessage::User { message } => {
                for part in &message.content {
                    if let ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = part
                    {
                        self.complete_tool(tool_use_id, content.text(), *is_error);
                    }
                }
            }
            _ => {}
        }
    }

    fn ingest_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ContentBlockDelta {
                delta: Delta::TextDelta { text },
                ..
            } => {
                self.push_text(text);
                self.saw_stream_text = true;
            }
            StreamEvent::ContentBlockStart {
                content_block: ContentPart::ToolUse { id, name, input },
                ..
            } => self.upsert_tool(id, name, input),
            StreamEvent::ContentBlockStart {
                content_block: ContentPart::Text { text },
                ..
            } if !text.is_empty() => {
                self.push_text(text);
                self.saw_stream_text = true;
            }
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.flush_tools();
        self.text.push_str(text);
    }

    fn upsert_tool(&mut self, id: &str, name: &str, input: &serde_json::Value) {
        if let Some(&index) = self.by_id.get(id) {
            let tool = &mut self.tools[index];
            if !name.is_empty() {
                tool.name = name.to_string();
            }
            if !is_empty_input(input) {
                tool.input = input.clone();
            }
            return;
        }

        self.flush_text();
        let index = self.tools.len();
        self.tools.push(ToolExecution {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
            status: ToolStatus::Running,
            output: None,
        });
        self.by_id.insert(id.to_string(), index);
        self.group.push(index);
    }

    fn complete_tool(&mut self, id: &str, output: String, is_error: bool) {
        let Some(&index) = self.by_id.get(id) else {
            tracing::debug!(tool_use_id = %id, "tool result for unknown call");
            return;
        };
        let tool = &mut self.tools[index];
        tool.status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        tool.output = Some(output);
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.blocks.push(Block::Text(std::mem::take(&mut self.text)));
        }
    }

    fn flush_tools(&mut self) {
        if !self.group.is_empty() {
            self.blocks.push(Block::Tools(std::mem::take(&mut self.group)));
        }
    }

    /// Close any open buffer and return the transcript. Later calls return
    /// the same transcript.
    pub fn finalize(&mut self) -> Transcript {
        if let Some(done) = &self.finalized {
            return done.clone();
        }

        self.flush_text();
        self.flush_tools();

        let blocks: Vec<ContentBlock> = self
            .blocks
            .iter()
            .map(|block| match block {
                Block::Text(content) => ContentBlock::Text {
                    content: content.clone(),
                },
                Block::Tools(indices) => ContentBlock::Tools {
                    tools: indices.iter().map(|&i| self.tools[i].clone()).collect(),
                },
            })
            .collect();
        let text = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { content } => Some(content.as_str()),
                ContentBlock::Tools { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let transcript = Transcript { text, blocks };
        self.finalized = Some(transcript.clone());
        transcript
    }
}

fn is_empty_input(input: &serde_json::Value) -> bool {
    match input {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
