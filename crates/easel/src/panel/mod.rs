//! Panel updates produced by sandboxed code.
//!
//! Updates reach the client two ways: live, through a [`PanelUpdateQueue`]
//! drained by the agent runtime while the snippet is still running, and
//! embedded in the `execute` result text between fixed markers for callers
//! that only see the tool result.

mod markers;
mod queue;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::models::Panel;

pub use markers::{END_MARKER, START_MARKER, embed_panel_updates, extract_panel_updates};
pub use queue::PanelUpdateQueue;

/// What happened to a panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelAction {
    /// A new panel appeared.
    Add,
    /// An existing panel changed.
    Update,
    /// A panel was removed.
    Remove,
}

/// One panel mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelUpdate {
    /// Kind of mutation.
    pub action: PanelAction,
    /// The panel after the mutation (or as it was, for removals).
    pub panel: Panel,
    /// Backing document content, so clients can render without a fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PanelUpdate {
    /// A panel was added.
    pub fn add(panel: Panel, data: Option<Value>) -> Self {
        Self {
            action: PanelAction::Add,
            panel,
            data,
        }
    }

    /// A panel was updated.
    pub fn update(panel: Panel, data: Option<Value>) -> Self {
        Self {
            action: PanelAction::Update,
            panel,
            data,
        }
    }

    /// A panel was removed.
    pub fn remove(panel: Panel) -> Self {
        Self {
            action: PanelAction::Remove,
            panel,
            data: None,
        }
    }
}
