//! On-disk workspace store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::lock::WorkspaceLocks;
use super::models::{
    CardsData, ChartData, Conversation, Group, Message, Panel, Table, UiState, Viewport, Workspace,
};
use super::{StoreError, validate_id};

const WORKSPACE_FILE: &str = "workspace.json";
const UI_FILE: &str = "ui.json";
const CONVERSATION_FILE: &str = "conversation.json";

/// A data document that backs a panel.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum DataDocument<'a> {
    /// `tables/<id>.json`
    Table(&'a Table),
    /// `charts/<id>.json`
    Chart(&'a ChartData),
    /// `cards/<id>.json`
    Cards(&'a CardsData),
}

impl DataDocument<'_> {
    fn location(&self) -> (&'static str, &str) {
        match self {
            DataDocument::Table(table) => ("tables", &table.id),
            DataDocument::Chart(chart) => ("charts", &chart.id),
            DataDocument::Cards(cards) => ("cards", &cards.id),
        }
    }
}

/// Handle to the workspace directory tree.
///
/// Cheap to clone; clones share the same lock table.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
    locks: WorkspaceLocks,
}

impl WorkspaceStore {
    /// Open a store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            root: data_dir.into().join("workspaces"),
            locks: WorkspaceLocks::new(lock_timeout),
        }
    }

    /// The lock table guarding this store.
    pub fn locks(&self) -> &WorkspaceLocks {
        &self.locks
    }

    /// Directory holding everything owned by `workspace_id`.
    pub fn workspace_dir(&self, workspace_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(workspace_id)?;
        Ok(self.root.join(workspace_id))
    }

    /// Directory holding the workspace's user files.
    pub fn files_dir(&self, workspace_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.workspace_dir(workspace_id)?.join("files"))
    }

    async fn existing_dir(&self, workspace_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.workspace_dir(workspace_id)?;
        if tokio::fs::try_exists(dir.join(WORKSPACE_FILE)).await? {
            Ok(dir)
        } else {
            Err(StoreError::NotFound(format!("workspace {workspace_id}")))
        }
    }

    // ==================== Workspaces ====================

    /// Create a workspace with a generated ID.
    pub async fn create_workspace(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Workspace, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_workspace_with_id(&id, name, description).await
    }

    /// Create a workspace with a caller-chosen ID.
    pub async fn create_workspace_with_id(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Workspace, StoreError> {
        let dir = self.workspace_dir(id)?;
        let _guard = self.locks.acquire(id).await?;

        if tokio::fs::try_exists(dir.join(WORKSPACE_FILE)).await? {
            return Err(StoreError::AlreadyExists(format!("workspace {id}")));
        }

        tokio::fs::create_dir_all(dir.join("files")).await?;
        let now = Utc::now();
        let workspace = Workspace {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
            system_prompt: None,
            enabled_tools: Vec::new(),
        };
        write_json(&dir.join(WORKSPACE_FILE), &workspace).await?;
        write_json_atomic(&dir.join(UI_FILE), &UiState::default()).await?;

        tracing::info!(workspace_id = %id, "created workspace");
        Ok(workspace)
    }

    /// Load a workspace's metadata.
    pub async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace, StoreError> {
        let dir = self.existing_dir(workspace_id).await?;
        read_json(&dir.join(WORKSPACE_FILE))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("workspace {workspace_id}")))
    }

    /// All workspaces, most recently updated first.
    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut workspaces = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(WORKSPACE_FILE);
            match read_json::<Workspace>(&path).await {
                Ok(Some(workspace)) => workspaces.push(workspace),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable workspace");
                }
            }
        }

        workspaces.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(workspaces)
    }

    /// Rename or re-describe a workspace.
    pub async fn update_workspace_info(
        &self,
        workspace_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Workspace, StoreError> {
        let _guard = self.locks.acquire(workspace_id).await?;
        let mut workspace = self.get_workspace(workspace_id).await?;

        if let Some(name) = name {
            workspace.name = name.to_string();
        }
        if let Some(description) = description {
            workspace.description = description.to_string();
        }
        workspace.updated_at = Utc::now();

        let dir = self.workspace_dir(workspace_id)?;
        write_json(&dir.join(WORKSPACE_FILE), &workspace).await?;
        Ok(workspace)
    }

    /// Delete a workspace and every document it owns.
    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(workspace_id).await?;
        let dir = self.existing_dir(workspace_id).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        tracing::info!(workspace_id = %workspace_id, "deleted workspace");
        Ok(())
    }

    // ==================== UI state ====================

    /// Load the canvas state; a workspace without `ui.json` has an empty canvas.
    pub async fn load_ui_state(&self, workspace_id: &str) -> Result<UiState, StoreError> {
        let dir = self.existing_dir(workspace_id).await?;
        Ok(read_json(&dir.join(UI_FILE)).await?.unwrap_or_default())
    }

    /// Replace the canvas state.
    pub async fn save_ui_state(&self, workspace_id: &str, state: &UiState) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(workspace_id).await?;
        let dir = self.existing_dir(workspace_id).await?;
        write_json_atomic(&dir.join(UI_FILE), state).await
    }

    /// Apply `f` to the canvas state under the workspace lock.
    ///
    /// The state is only written back when `f` succeeds.
    pub async fn mutate_ui_state<F, T>(&self, workspace_id: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut UiState) -> Result<T, StoreError>,
    {
        let _guard = self.locks.acquire(workspace_id).await?;
        let dir = self.existing_dir(workspace_id).await?;
        let path = dir.join(UI_FILE);

        let mut state: UiState = read_json(&path).await?.unwrap_or_default();
        let out = f(&mut state)?;
        write_json_atomic(&path, &state).await?;
        Ok(out)
    }

    /// Write `document` and apply `f` to the canvas state in one critical
    /// section, so the document and the panel showing it change together.
    ///
    /// Nothing is written when `f` fails.
    pub async fn save_document_with_ui<F, T>(
        &self,
        workspace_id: &str,
        document: DataDocument<'_>,
        f: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce(&mut UiState) -> Result<T, StoreError>,
    {
        let (kind, id) = document.location();
        validate_id(id)?;
        let _guard = self.locks.acquire(workspace_id).await?;
        let dir = self.existing_dir(workspace_id).await?;
        let path = dir.join(UI_FILE);

        let mut state: UiState = read_json(&path).await?.unwrap_or_default();
        let out = f(&mut state)?;
        write_document(&dir.join(kind).join(format!("{id}.json")), &document).await?;
        write_json_atomic(&path, &state).await?;
        Ok(out)
    }

    /// Append a panel; the ID must be new.
    pub async fn add_panel(&self, workspace_id: &str, panel: Panel) -> Result<Panel, StoreError> {
        validate_id(&panel.id)?;
        self.mutate_ui_state(workspace_id, |state| {
            if state.panel(&panel.id).is_some() {
                return Err(StoreError::AlreadyExists(format!("panel {}", panel.id)));
            }
            state.panels.push(panel.clone());
            Ok(panel)
        })
        .await
    }

    /// Remove a panel along with its group memberships and connections.
    pub async fn remove_panel(&self, workspace_id: &str, panel_id: &str) -> Result<Panel, StoreError> {
        self.mutate_ui_state(workspace_id, |state| {
            state
                .remove_panel(panel_id)
                .ok_or_else(|| StoreError::NotFound(format!("panel {panel_id}")))
        })
        .await
    }

    /// Merge a JSON object into a panel.
    ///
    /// Keys in `patch` replace the panel's keys; `null` clears optional
    /// fields. The panel ID cannot be changed.
    pub async fn update_panel(
        &self,
        workspace_id: &str,
        panel_id: &str,
        patch: &Value,
    ) -> Result<Panel, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::Json(serde::de::Error::custom(
                "panel patch must be an object",
            )));
        };

        self.mutate_ui_state(workspace_id, |state| {
            let panel = state
                .panel_mut(panel_id)
                .ok_or_else(|| StoreError::NotFound(format!("panel {panel_id}")))?;

            let mut merged = serde_json::to_value(&*panel)?;
            if let Value::Object(fields) = &mut merged {
                for (key, value) in patch {
                    if key == "id" {
                        continue;
                    }
                    if value.is_null() {
                        fields.remove(key);
                    } else {
                        fields.insert(key.clone(), value.clone());
                    }
                }
            }

            *panel = serde_json::from_value(merged)?;
            Ok(panel.clone())
        })
        .await
    }

    /// Replace the viewport.
    pub async fn update_viewport(&self, workspace_id: &str, viewport: Viewport) -> Result<(), StoreError> {
        self.mutate_ui_state(workspace_id, |state| {
            state.viewport = viewport;
            Ok(())
        })
        .await
    }

    /// Replace the groups, dropping unknown members and groups left with
    /// fewer than two panels.
    pub async fn set_groups(&self, workspace_id: &str, groups: Vec<Group>) -> Result<(), StoreError> {
        self.mutate_ui_state(workspace_id, |state| {
            let mut groups = groups;
            for group in &mut groups {
                group
                    .panel_ids
                    .retain(|id| state.panels.iter().any(|p| &p.id == id));
            }
            groups.retain(|g| g.panel_ids.len() >= 2);
            state.groups = groups;
            Ok(())
        })
        .await
    }

    // ==================== Documents ====================

    async fn document_path(
        &self,
        workspace_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        let dir = self.existing_dir(workspace_id).await?;
        Ok(dir.join(kind).join(format!("{id}.json")))
    }

    /// Load a table document.
    pub async fn get_table(&self, workspace_id: &str, table_id: &str) -> Result<Option<Table>, StoreError> {
        read_json(&self.document_path(workspace_id, "tables", table_id).await?).await
    }

    /// Write a table document.
    pub async fn save_table(&self, workspace_id: &str, table: &Table) -> Result<(), StoreError> {
        write_document(&self.document_path(workspace_id, "tables", &table.id).await?, table).await
    }

    /// Delete a table document; returns whether it existed.
    pub async fn delete_table(&self, workspace_id: &str, table_id: &str) -> Result<bool, StoreError> {
        let path = self.document_path(workspace_id, "tables", table_id).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a chart document.
    pub async fn get_chart(&self, workspace_id: &str, chart_id: &str) -> Result<Option<ChartData>, StoreError> {
        read_json(&self.document_path(workspace_id, "charts", chart_id).await?).await
    }

    /// Write a chart document.
    pub async fn save_chart(&self, workspace_id: &str, chart: &ChartData) -> Result<(), StoreError> {
        write_document(&self.document_path(workspace_id, "charts", &chart.id).await?, chart).await
    }

    /// Load a cards document.
    pub async fn get_cards(&self, workspace_id: &str, cards_id: &str) -> Result<Option<CardsData>, StoreError> {
        read_json(&self.document_path(workspace_id, "cards", cards_id).await?).await
    }

    /// Write a cards document.
    pub async fn save_cards(&self, workspace_id: &str, cards: &CardsData) -> Result<(), StoreError> {
        write_document(&self.document_path(workspace_id, "cards", &cards.id).await?, cards).await
    }

    // ==================== Conversation ====================

    /// Load the conversation log.
    pub async fn load_conversation(&self, workspace_id: &str) -> Result<Conversation, StoreError> {
        let dir = self.existing_dir(workspace_id).await?;
        Ok(read_json(&dir.join(CONVERSATION_FILE)).await?.unwrap_or_default())
    }

    /// Append one message to the conversation log.
    pub async fn append_message(&self, workspace_id: &str, message: Message) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(workspace_id).await?;
        let dir = self.existing_dir(workspace_id).await?;
        let path = dir.join(CONVERSATION_FILE);

        let mut conversation: Conversation = read_json(&path).await?.unwrap_or_default();
        conversation.messages.push(message);
        write_json(&path, &conversation).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Atomic write that also creates the document's directory.
async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_json_atomic(path, value).await
}

/// Write to a sibling temp file, fsync, then rename over `path`.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!("{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        tracing::error!(path = %path.display(), error = %e, "atomic write failed");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::models::{Connection, PanelKind};
    use serde_json::json;

    async fn store_with_workspace() -> (tempfile::TempDir, WorkspaceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));
        store
            .create_workspace_with_id("ws", "Test", "")
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_list_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));

        assert!(store.list_workspaces().await.unwrap().is_empty());

        let created = store.create_workspace("Sales", "Q1 numbers").await.unwrap();
        let listed = store.list_workspaces().await.unwrap();
        assert_eq!(listed, vec![created.clone()]);

        let err = store
            .create_workspace_with_id(&created.id, "Again", "")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete_workspace() {
        let (_dir, store) = store_with_workspace().await;

        let updated = store
            .update_workspace_info("ws", Some("Renamed"), None)
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert!(updated.updated_at >= updated.created_at);

        store.delete_workspace("ws").await.unwrap();
        assert!(matches!(
            store.get_workspace("ws").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_ui_state_defaults() {
        let (_dir, store) = store_with_workspace().await;
        let path = store.workspace_dir("ws").unwrap().join(UI_FILE);
        tokio::fs::remove_file(&path).await.unwrap();

        let state = store.load_ui_state("ws").await.unwrap();
        assert_eq!(state, UiState::default());
    }

    #[tokio::test]
    async fn test_add_panel_rejects_duplicates() {
        let (_dir, store) = store_with_workspace().await;

        store
            .add_panel("ws", Panel::new("chat", PanelKind::Chat))
            .await
            .unwrap();
        let err = store
            .add_panel("ws", Panel::new("chat", PanelKind::Chat))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.load_ui_state("ws").await.unwrap().panels.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_panel_cascades_to_groups_and_connections() {
        let (_dir, store) = store_with_workspace().await;
        for id in ["a", "b"] {
            store
                .add_panel("ws", Panel::new(id, PanelKind::Chat))
                .await
                .unwrap();
        }
        store
            .set_groups(
                "ws",
                vec![Group {
                    id: "g".into(),
                    panel_ids: vec!["a".into(), "b".into()],
                    label: None,
                    color: None,
                }],
            )
            .await
            .unwrap();
        store
            .mutate_ui_state("ws", |state| {
                state.connections.push(Connection {
                    id: "c".into(),
                    from: "a".into(),
                    to: "b".into(),
                    label: None,
                });
                Ok(())
            })
            .await
            .unwrap();

        store.remove_panel("ws", "a").await.unwrap();

        let state = store.load_ui_state("ws").await.unwrap();
        assert_eq!(state.panels.len(), 1);
        assert!(state.groups.is_empty());
        assert!(state.connections.is_empty());
    }

    #[tokio::test]
    async fn test_update_panel_merges_patch() {
        let (_dir, store) = store_with_workspace().await;
        store
            .add_panel(
                "ws",
                Panel::new(
                    "notes",
                    PanelKind::Markdown {
                        content: "old".into(),
                    },
                ),
            )
            .await
            .unwrap();

        let panel = store
            .update_panel(
                "ws",
                "notes",
                &json!({"id": "renamed", "title": "Notes", "content": "new"}),
            )
            .await
            .unwrap();

        assert_eq!(panel.id, "notes");
        assert_eq!(panel.title.as_deref(), Some("Notes"));
        assert_eq!(
            panel.kind,
            PanelKind::Markdown {
                content: "new".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_untouched() {
        let (_dir, store) = store_with_workspace().await;
        store
            .add_panel("ws", Panel::new("a", PanelKind::Chat))
            .await
            .unwrap();

        let result: Result<(), _> = store
            .mutate_ui_state("ws", |state| {
                state.panels.clear();
                Err(StoreError::NotFound("nope".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.load_ui_state("ws").await.unwrap().panels.len(), 1);
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_files() {
        let (_dir, store) = store_with_workspace().await;
        store
            .update_viewport(
                "ws",
                Viewport {
                    x: 5.0,
                    y: 6.0,
                    zoom: 2.0,
                },
            )
            .await
            .unwrap();

        let mut entries = tokio::fs::read_dir(store.workspace_dir("ws").unwrap())
            .await
            .unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(!name.contains(".tmp-"), "leftover temp file {name}");
        }
        assert_eq!(store.load_ui_state("ws").await.unwrap().viewport.zoom, 2.0);
    }

    #[tokio::test]
    async fn test_table_documents() {
        let (_dir, store) = store_with_workspace().await;
        let table = Table {
            id: "sales".into(),
            title: None,
            columns: Vec::new(),
            data: vec![json!({"a": 1})],
            updated_at: Utc::now(),
        };

        assert!(store.get_table("ws", "sales").await.unwrap().is_none());
        store.save_table("ws", &table).await.unwrap();
        assert_eq!(store.get_table("ws", "sales").await.unwrap(), Some(table));
        assert!(store.delete_table("ws", "sales").await.unwrap());
        assert!(!store.delete_table("ws", "sales").await.unwrap());

        assert!(matches!(
            store.get_table("ws", "../ui").await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_document_saved_with_ui_state() {
        let (_dir, store) = store_with_workspace().await;
        let table = Table {
            id: "orders".into(),
            title: None,
            columns: Vec::new(),
            data: vec![json!({"id": 1})],
            updated_at: Utc::now(),
        };

        let failed: Result<(), _> = store
            .save_document_with_ui("ws", DataDocument::Table(&table), |_| {
                Err(StoreError::AlreadyExists("panel".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(store.get_table("ws", "orders").await.unwrap().is_none());

        store
            .save_document_with_ui("ws", DataDocument::Table(&table), |state| {
                state.panels.push(Panel::new("table-orders", PanelKind::Table { table_id: "orders".into() }));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.get_table("ws", "orders").await.unwrap(), Some(table));
        assert!(store.load_ui_state("ws").await.unwrap().panel("table-orders").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_every_message() {
        let (_dir, store) = store_with_workspace().await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message("ws", Message::user(format!("m{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.load_conversation("ws").await.unwrap().messages.len(), 10);
    }
}
