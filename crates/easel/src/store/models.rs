//! Persisted documents owned by a workspace.
//!
//! Every optional field defaults when absent so documents written by older
//! versions keep loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A workspace and its agent settings (`workspace.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Unique workspace ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Extra system prompt text for the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tool names the agent may call in this workspace.
    #[serde(default)]
    pub enabled_tools: Vec<String>,
}

/// Canvas state of a workspace (`ui.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    /// Panels in z-order.
    #[serde(default)]
    pub panels: Vec<Panel>,
    /// Pan and zoom.
    #[serde(default)]
    pub viewport: Viewport,
    /// Panel groups.
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Edges between panels.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl UiState {
    /// Look up a panel by ID.
    pub fn panel(&self, id: &str) -> Option<&Panel> {
        self.panels.iter().find(|p| p.id == id)
    }

    /// Look up a panel by ID for modification.
    pub fn panel_mut(&mut self, id: &str) -> Option<&mut Panel> {
        self.panels.iter_mut().find(|p| p.id == id)
    }

    /// Remove a panel and every reference to it.
    ///
    /// Groups left with fewer than two members are dropped.
    pub fn remove_panel(&mut self, id: &str) -> Option<Panel> {
        let index = self.panels.iter().position(|p| p.id == id)?;
        let removed = self.panels.remove(index);

        for group in &mut self.groups {
            group.panel_ids.retain(|member| member != id);
        }
        self.groups.retain(|group| group.panel_ids.len() >= 2);
        self.connections.retain(|c| c.from != id && c.to != id);

        Some(removed)
    }
}

/// Canvas pan/zoom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    /// Horizontal pan.
    pub x: f64,
    /// Vertical pan.
    pub y: f64,
    /// Zoom factor.
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

/// A named set of panels moved together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group ID.
    pub id: String,
    /// Member panel IDs.
    #[serde(default)]
    pub panel_ids: Vec<String>,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Optional color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A directed edge between two panels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection ID.
    pub id: String,
    /// Source panel ID.
    pub from: String,
    /// Target panel ID.
    pub to: String,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Explicit on-canvas placement. Absent means the client picks a spot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelLayout {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width, if fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// Height, if fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// One unit on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    /// Panel ID, unique within the workspace.
    pub id: String,
    /// Title bar text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Placement; `None` lets the client decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<PanelLayout>,
    /// Variant-specific content.
    #[serde(flatten)]
    pub kind: PanelKind,
}

impl Panel {
    /// Create an unplaced panel.
    pub fn new(id: impl Into<String>, kind: PanelKind) -> Self {
        Self {
            id: id.into(),
            title: None,
            layout: None,
            kind,
        }
    }

    /// Set the title.
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    /// Set the layout.
    pub fn with_layout(mut self, layout: Option<PanelLayout>) -> Self {
        self.layout = layout;
        self
    }
}

/// Panel variants, each carrying only its own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PanelKind {
    /// The chat transcript.
    Chat,
    /// A table document.
    Table {
        /// Backing table ID.
        table_id: String,
    },
    /// A chart document.
    Chart {
        /// Backing chart ID.
        chart_id: String,
    },
    /// A cards document.
    Cards {
        /// Backing cards ID.
        cards_id: String,
    },
    /// Inline markdown.
    Markdown {
        /// Markdown source.
        #[serde(default)]
        content: String,
    },
    /// A PDF from the workspace files.
    Pdf {
        /// Path relative to the files area.
        file_path: String,
    },
    /// A code/text editor on a workspace file.
    Editor {
        /// Path relative to the files area.
        file_path: String,
        /// Syntax hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    /// A web or file preview.
    Preview {
        /// External URL.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Workspace file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
    },
    /// Tree view of the files area.
    FileTree {
        /// Subdirectory to root the tree at.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<String>,
    },
    /// Key/value detail view.
    Detail {
        /// Arbitrary record.
        #[serde(default)]
        data: Value,
    },
}

impl PanelKind {
    /// Lower-case variant name as written in documents.
    pub fn type_name(&self) -> &'static str {
        match self {
            PanelKind::Chat => "chat",
            PanelKind::Table { .. } => "table",
            PanelKind::Chart { .. } => "chart",
            PanelKind::Cards { .. } => "cards",
            PanelKind::Markdown { .. } => "markdown",
            PanelKind::Pdf { .. } => "pdf",
            PanelKind::Editor { .. } => "editor",
            PanelKind::Preview { .. } => "preview",
            PanelKind::FileTree { .. } => "fileTree",
            PanelKind::Detail { .. } => "detail",
        }
    }
}

/// Render hint for a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Free text.
    Text,
    /// Numeric.
    Number,
    /// True/false.
    Boolean,
    /// Nested JSON.
    Json,
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Row field this column shows.
    pub key: String,
    /// Header text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Render hint.
    #[serde(rename = "type", default = "default_column_type")]
    pub column_type: ColumnType,
}

fn default_column_type() -> ColumnType {
    ColumnType::Text
}

/// A table document (`tables/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Table ID.
    pub id: String,
    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Column definitions.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Row objects.
    #[serde(default)]
    pub data: Vec<Value>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl Table {
    /// Derive columns from the keys of the first row.
    pub fn infer_columns(rows: &[Value]) -> Vec<Column> {
        let Some(Value::Object(first)) = rows.first() else {
            return Vec::new();
        };

        first
            .iter()
            .map(|(key, value)| Column {
                key: key.clone(),
                label: None,
                column_type: match value {
                    Value::Number(_) => ColumnType::Number,
                    Value::Bool(_) => ColumnType::Boolean,
                    Value::Array(_) | Value::Object(_) => ColumnType::Json,
                    Value::String(_) | Value::Null => ColumnType::Text,
                },
            })
            .collect()
    }
}

/// Chart flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    /// Vertical bars.
    #[default]
    Bar,
    /// Lines.
    Line,
    /// Filled lines.
    Area,
    /// Pie.
    Pie,
    /// Scatter plot.
    Scatter,
}

/// A chart document (`charts/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    /// Chart ID.
    pub id: String,
    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Chart flavour.
    #[serde(rename = "type", default)]
    pub chart_type: ChartType,
    /// Data points.
    #[serde(default)]
    pub data: Vec<Value>,
    /// Field used for the x axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_key: Option<String>,
    /// Fields plotted on the y axis.
    #[serde(default)]
    pub y_keys: Vec<String>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// A cards document (`cards/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardsData {
    /// Cards ID.
    pub id: String,
    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Card records.
    #[serde(default)]
    pub items: Vec<Value>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// The conversation log (`conversation.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Messages in order.
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human.
    User,
    /// The agent.
    Assistant,
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID.
    pub id: String,
    /// Author.
    pub role: Role,
    /// Plain text.
    #[serde(default)]
    pub content: String,
    /// Structured transcript for assistant turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Vec<ContentBlock>>,
    /// When the message was recorded.
    pub created_at: DateTime<Utc>,
    /// Set when the turn was cancelled before completing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stopped: bool,
}

impl Message {
    /// A user message stamped now.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            blocks: None,
            created_at: Utc::now(),
            stopped: false,
        }
    }

    /// An assistant message stamped now.
    pub fn assistant(content: impl Into<String>, blocks: Vec<ContentBlock>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.into(),
            blocks: Some(blocks),
            created_at: Utc::now(),
            stopped: false,
        }
    }
}

/// A segment of a reconstructed assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    /// Prose.
    Text {
        /// The text.
        content: String,
    },
    /// Consecutive tool calls.
    Tools {
        /// Calls in order of first sighting.
        tools: Vec<ToolExecution>,
    },
}

/// Lifecycle of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// No result yet.
    Running,
    /// Completed.
    Success,
    /// Completed with an error.
    Error,
}

/// One tool call in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    /// Provider-issued call ID.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Call input.
    #[serde(default)]
    pub input: Value,
    /// Current status.
    pub status: ToolStatus,
    /// Captured result text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_panel_serializes_flat_with_type_tag() {
        let panel = Panel::new(
            "table-sales",
            PanelKind::Table {
                table_id: "sales".to_string(),
            },
        )
        .with_title(Some("Sales".to_string()));

        let value = serde_json::to_value(&panel).unwrap();
        assert_eq!(
            value,
            json!({"id": "table-sales", "title": "Sales", "type": "table", "tableId": "sales"})
        );
    }

    #[test]
    fn test_panel_roundtrip_all_variants() {
        let kinds = vec![
            PanelKind::Chat,
            PanelKind::Markdown {
                content: "# hi".to_string(),
            },
            PanelKind::Editor {
                file_path: "src/a.js".to_string(),
                language: Some("javascript".to_string()),
            },
            PanelKind::FileTree { root: None },
            PanelKind::Detail {
                data: json!({"k": 1}),
            },
        ];

        for kind in kinds {
            let panel = Panel::new("p", kind).with_layout(Some(PanelLayout {
                x: 10.0,
                y: 20.0,
                width: None,
                height: Some(300.0),
            }));
            let text = serde_json::to_string(&panel).unwrap();
            let back: Panel = serde_json::from_str(&text).unwrap();
            assert_eq!(back, panel);
        }
    }

    #[test]
    fn test_ui_state_defaults_missing_fields() {
        let state: UiState =
            serde_json::from_str(r#"{"panels": [{"id": "c", "type": "chat"}]}"#).unwrap();

        assert_eq!(state.panels.len(), 1);
        assert_eq!(state.viewport, Viewport::default());
        assert!(state.groups.is_empty());
        assert!(state.connections.is_empty());
    }

    #[test]
    fn test_remove_panel_cascades() {
        let mut state = UiState {
            panels: vec![
                Panel::new("a", PanelKind::Chat),
                Panel::new("b", PanelKind::Chat),
                Panel::new("c", PanelKind::Chat),
            ],
            groups: vec![
                Group {
                    id: "g1".into(),
                    panel_ids: vec!["a".into(), "b".into()],
                    label: None,
                    color: None,
                },
                Group {
                    id: "g2".into(),
                    panel_ids: vec!["a".into(), "b".into(), "c".into()],
                    label: None,
                    color: None,
                },
            ],
            connections: vec![Connection {
                id: "e".into(),
                from: "a".into(),
                to: "c".into(),
                label: None,
            }],
            ..UiState::default()
        };

        let removed = state.remove_panel("a").unwrap();

        assert_eq!(removed.id, "a");
        assert_eq!(state.panels.len(), 2);
        // g1 shrank to one member and is gone; g2 keeps b and c
        assert_eq!(state.groups.len(), 1);
        assert_eq!(state.groups[0].panel_ids, vec!["b", "c"]);
        assert!(state.connections.is_empty());
        assert!(state.remove_panel("missing").is_none());
    }

    #[test]
    fn test_infer_columns() {
        let rows = vec![json!({"name": "a", "qty": 3, "ok": true, "tags": []})];
        let columns = Table::infer_columns(&rows);

        let find = |key: &str| columns.iter().find(|c| c.key == key).unwrap().column_type;
        assert_eq!(find("name"), ColumnType::Text);
        assert_eq!(find("qty"), ColumnType::Number);
        assert_eq!(find("ok"), ColumnType::Boolean);
        assert_eq!(find("tags"), ColumnType::Json);
        assert!(Table::infer_columns(&[]).is_empty());
    }

    #[test]
    fn test_message_stopped_flag_omitted_when_false() {
        let message = Message::user("hi");
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("stopped").is_none());
    }
}
