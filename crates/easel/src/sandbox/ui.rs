//! Capabilities that touch workspace documents and the canvas.
//!
//! Every panel mutation happens inside the workspace lock, so the "does a
//! panel for this document exist yet" check and the insert are one critical
//! section. `setTable`, `setChart` and `setCards` also write their document
//! inside that section. Two concurrent `setTable("t", ...)` calls therefore
//! end with one panel whose data matches the document on disk.

use chrono::Utc;
use serde_json::{Map, Value, json};

use super::CapabilityError;
use super::host::{Host, to_value};
use crate::panel::{PanelAction, PanelUpdate};
use crate::policy::Operation;
use crate::store::models::{CardsData, ChartData, ChartType, Panel, PanelKind, PanelLayout, Table, UiState};
use crate::store::{DataDocument, StoreError, validate_id};

/// A `kind:id` resource address as accepted by `read` and `write`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Address {
    Table(String),
    Chart(String),
    Cards(String),
    Markdown(String),
    File(String),
}

impl Address {
    fn parse(raw: &str) -> Result<Self, CapabilityError> {
        let Some((kind, rest)) = raw.split_once(':') else {
            return Ok(Address::File(raw.to_string()));
        };
        let rest = rest.to_string();
        match kind {
            "table" => Ok(Address::Table(rest)),
            "chart" => Ok(Address::Chart(rest)),
            "cards" => Ok(Address::Cards(rest)),
            "markdown" => Ok(Address::Markdown(rest)),
            "file" => Ok(Address::File(rest)),
            other => Err(CapabilityError::InvalidArgument(format!(
                "unknown resource type {other:?}; expected table:, chart:, cards:, markdown: or file:"
            ))),
        }
    }
}

/// How a panel upsert should behave.
struct PanelTarget<F> {
    /// ID used when a new panel has to be created.
    id: String,
    /// Whether an existing panel already shows this document.
    owns: F,
    kind: PanelKind,
    title: Option<String>,
    layout: Option<PanelLayout>,
}

impl Host {
    pub(crate) async fn read(&self, source: &str) -> Result<Value, CapabilityError> {
        let ctx = &self.ctx;
        let ws = ctx.workspace_id.as_str();
        match Address::parse(source)? {
            Address::Table(id) => {
                let table = ctx.store.get_table(ws, &id).await?;
                let table = table.ok_or_else(|| CapabilityError::NotFound(format!("table {id}")))?;
                Ok(Value::Array(table.data))
            }
            Address::Chart(id) => {
                let chart = ctx.store.get_chart(ws, &id).await?;
                to_value(chart.ok_or_else(|| CapabilityError::NotFound(format!("chart {id}")))?)
            }
            Address::Cards(id) => {
                let cards = ctx.store.get_cards(ws, &id).await?;
                let cards = cards.ok_or_else(|| CapabilityError::NotFound(format!("cards {id}")))?;
                Ok(Value::Array(cards.items))
            }
            Address::Markdown(id) => {
                let state = ctx.store.load_ui_state(ws).await?;
                match state.panel(&id).map(|p| &p.kind) {
                    Some(PanelKind::Markdown { content }) => Ok(Value::String(content.clone())),
                    _ => Err(CapabilityError::NotFound(format!("markdown panel {id}"))),
                }
            }
            Address::File(path) => {
                let text = ctx
                    .files
                    .read_text(&path, ctx.limits.max_read_bytes as usize)
                    .await?;
                Ok(Value::String(text))
            }
        }
    }

    pub(crate) async fn write(&self, data: Value, destination: &str) -> Result<Value, CapabilityError> {
        let ctx = &self.ctx;
        let ws = ctx.workspace_id.as_str();
        let count = match &data {
            Value::Array(rows) => rows.len(),
            _ => 1,
        };

        match Address::parse(destination)? {
            Address::Table(id) => {
                let rows = expect_rows(data, "table data")?;
                let title = ctx.store.get_table(ws, &id).await?.and_then(|t| t.title);
                let table = Table {
                    columns: Table::infer_columns(&rows),
                    id,
                    title,
                    data: rows,
                    updated_at: Utc::now(),
                };
                ctx.store.save_table(ws, &table).await?;
            }
            Address::Chart(id) => {
                let rows = expect_rows(data, "chart data")?;
                let mut chart = match ctx.store.get_chart(ws, &id).await? {
                    Some(existing) => existing,
                    None => {
                        let (x_key, y_keys) = infer_axes(&rows);
                        ChartData {
                            id,
                            title: None,
                            chart_type: ChartType::default(),
                            data: Vec::new(),
                            x_key,
                            y_keys,
                            updated_at: Utc::now(),
                        }
                    }
                };
                chart.data = rows;
                chart.updated_at = Utc::now();
                ctx.store.save_chart(ws, &chart).await?;
            }
            Address::Cards(id) => {
                let items = expect_rows(data, "cards items")?;
                let title = ctx.store.get_cards(ws, &id).await?.and_then(|c| c.title);
                let cards = CardsData {
                    id,
                    title,
                    items,
                    updated_at: Utc::now(),
                };
                ctx.store.save_cards(ws, &cards).await?;
            }
            Address::Markdown(id) => {
                let text = match data {
                    Value::String(s) => s,
                    other => serde_json::to_string_pretty(&other)
                        .map_err(|e| CapabilityError::InvalidArgument(e.to_string()))?,
                };
                let panel = ctx
                    .store
                    .mutate_ui_state(ws, |state| {
                        let panel = state
                            .panel_mut(&id)
                            .filter(|p| matches!(p.kind, PanelKind::Markdown { .. }))
                            .ok_or_else(|| StoreError::NotFound(format!("markdown panel {id}")))?;
                        panel.kind = PanelKind::Markdown { content: text };
                        Ok(panel.clone())
                    })
                    .await?;
                self.emit(PanelUpdate::update(panel, None));
            }
            Address::File(path) => {
                let written = ctx.files.write(&path, &data, "write").await?;
                return Ok(json!({ "destination": format!("file:{written}"), "count": count }));
            }
        }

        Ok(json!({ "destination": destination, "count": count }))
    }

    pub(crate) async fn set_table(&self, id: &str, options: Map<String, Value>) -> Result<Value, CapabilityError> {
        let rows = expect_rows(options.get("data").cloned().unwrap_or_default(), "data")?;
        let columns = match options.get("columns") {
            None | Some(Value::Null) => Table::infer_columns(&rows),
            Some(columns) => serde_json::from_value(columns.clone())
                .map_err(|e| CapabilityError::InvalidArgument(format!("invalid columns: {e}")))?,
        };
        let title = string_option(&options, "title");
        let table = Table {
            id: id.to_string(),
            title: title.clone(),
            columns,
            data: rows,
            updated_at: Utc::now(),
        };
        let table_id = id.to_string();
        let panel = self
            .upsert_panel(
                PanelTarget {
                    id: format!("table-{id}"),
                    owns: move |p: &Panel| matches!(&p.kind, PanelKind::Table { table_id: t } if *t == table_id),
                    kind: PanelKind::Table { table_id: id.to_string() },
                    title,
                    layout: layout_option(&options)?,
                },
                Some(DataDocument::Table(&table)),
            )
            .await?;
        Ok(json!({ "panelId": panel.id, "rows": table.data.len() }))
    }

    pub(crate) async fn set_chart(&self, id: &str, options: Map<String, Value>) -> Result<Value, CapabilityError> {
        let rows = expect_rows(options.get("data").cloned().unwrap_or_default(), "data")?;
        let chart_type = match options.get("type") {
            None | Some(Value::Null) => ChartType::default(),
            Some(kind) => serde_json::from_value(kind.clone())
                .map_err(|e| CapabilityError::InvalidArgument(format!("invalid chart type: {e}")))?,
        };
        let (inferred_x, inferred_y) = infer_axes(&rows);
        let x_key = string_option(&options, "xKey").or(inferred_x);
        let y_keys = match options.get("yKeys") {
            Some(Value::Array(keys)) => keys.iter().filter_map(Value::as_str).map(String::from).collect(),
            Some(Value::String(key)) => vec![key.clone()],
            _ => inferred_y
                .into_iter()
                .filter(|k| Some(k) != x_key.as_ref())
                .collect(),
        };
        let title = string_option(&options, "title");
        let chart = ChartData {
            id: id.to_string(),
            title: title.clone(),
            chart_type,
            data: rows,
            x_key,
            y_keys,
            updated_at: Utc::now(),
        };
        let chart_id = id.to_string();
        let panel = self
            .upsert_panel(
                PanelTarget {
                    id: format!("chart-{id}"),
                    owns: move |p: &Panel| matches!(&p.kind, PanelKind::Chart { chart_id: c } if *c == chart_id),
                    kind: PanelKind::Chart { chart_id: id.to_string() },
                    title,
                    layout: layout_option(&options)?,
                },
                Some(DataDocument::Chart(&chart)),
            )
            .await?;
        Ok(json!({ "panelId": panel.id, "points": chart.data.len() }))
    }

    pub(crate) async fn set_cards(&self, id: &str, options: Map<String, Value>) -> Result<Value, CapabilityError> {
        let items = expect_rows(options.get("items").cloned().unwrap_or_default(), "items")?;
        let title = string_option(&options, "title");
        let cards = CardsData {
            id: id.to_string(),
            title: title.clone(),
            items,
            updated_at: Utc::now(),
        };
        let cards_id = id.to_string();
        let panel = self
            .upsert_panel(
                PanelTarget {
                    id: format!("cards-{id}"),
                    owns: move |p: &Panel| matches!(&p.kind, PanelKind::Cards { cards_id: c } if *c == cards_id),
                    kind: PanelKind::Cards { cards_id: id.to_string() },
                    title,
                    layout: layout_option(&options)?,
                },
                Some(DataDocument::Cards(&cards)),
            )
            .await?;
        Ok(json!({ "panelId": panel.id, "items": cards.items.len() }))
    }

    pub(crate) async fn set_markdown(
        &self,
        id: &str,
        content: &str,
        options: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let panel_id = id.to_string();
        let panel = self
            .upsert_panel(
                PanelTarget {
                    id: id.to_string(),
                    owns: move |p: &Panel| p.id == panel_id && matches!(p.kind, PanelKind::Markdown { .. }),
                    kind: PanelKind::Markdown { content: content.to_string() },
                    title: string_option(&options, "title"),
                    layout: layout_option(&options)?,
                },
                None,
            )
            .await?;
        Ok(json!({ "panelId": panel.id }))
    }

    pub(crate) async fn set_pdf(&self, id: &str, path: &str, options: Map<String, Value>) -> Result<Value, CapabilityError> {
        let target = self.ctx.files.authorize(path, Operation::Read, "setPdf")?;
        if !tokio::fs::try_exists(&target.host).await? {
            return Err(CapabilityError::NotFound(format!("file {}", target.relative)));
        }

        let panel_id = id.to_string();
        let panel = self
            .upsert_panel(
                PanelTarget {
                    id: id.to_string(),
                    owns: move |p: &Panel| p.id == panel_id && matches!(p.kind, PanelKind::Pdf { .. }),
                    kind: PanelKind::Pdf { file_path: target.relative },
                    title: string_option(&options, "title"),
                    layout: layout_option(&options)?,
                },
                None,
            )
            .await?;
        Ok(json!({ "panelId": panel.id }))
    }

    pub(crate) async fn add_panel(&self, mut fields: Map<String, Value>) -> Result<Value, CapabilityError> {
        if !fields.get("id").is_some_and(Value::is_string) {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            fields.insert("id".to_string(), Value::String(format!("panel-{}", &generated[..8])));
        }
        let panel: Panel = serde_json::from_value(Value::Object(fields))
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid panel: {e}")))?;

        let panel = self.ctx.store.add_panel(&self.ctx.workspace_id, panel).await?;
        let id = panel.id.clone();
        self.emit(PanelUpdate::add(panel, None));
        Ok(json!({ "panelId": id }))
    }

    pub(crate) async fn remove_panel(&self, id: &str) -> Result<Value, CapabilityError> {
        let panel = self.ctx.store.remove_panel(&self.ctx.workspace_id, id).await?;
        self.emit(PanelUpdate::remove(panel));
        Ok(json!({ "panelId": id }))
    }

    pub(crate) async fn update_panel(&self, id: &str, patch: &Value) -> Result<Value, CapabilityError> {
        if !patch.is_object() {
            return Err(CapabilityError::InvalidArgument("panel patch must be an object".to_string()));
        }
        let panel = self
            .ctx
            .store
            .update_panel(&self.ctx.workspace_id, id, patch)
            .await?;
        self.emit(PanelUpdate::update(panel, None));
        Ok(json!({ "panelId": id }))
    }

    pub(crate) async fn move_panel(&self, id: &str, layout: PanelLayout) -> Result<Value, CapabilityError> {
        let panel = self
            .ctx
            .store
            .mutate_ui_state(&self.ctx.workspace_id, |state| {
                let panel = state
                    .panel_mut(id)
                    .ok_or_else(|| StoreError::NotFound(format!("panel {id}")))?;
                panel.layout = Some(layout);
                Ok(panel.clone())
            })
            .await?;
        self.emit(PanelUpdate::update(panel, None));
        Ok(json!({ "panelId": id }))
    }

    /// Create the panel for a document, or refresh the one that already
    /// shows it, then emit the matching update.
    async fn upsert_panel<F>(
        &self,
        target: PanelTarget<F>,
        document: Option<DataDocument<'_>>,
    ) -> Result<Panel, CapabilityError>
    where
        F: Fn(&Panel) -> bool + Send,
    {
        let PanelTarget {
            id,
            owns,
            kind,
            title,
            layout,
        } = target;

        let apply = move |state: &mut UiState| -> Result<(PanelAction, Panel), StoreError> {
            if let Some(panel) = state.panels.iter_mut().find(|p| owns(&**p)) {
                panel.kind = kind;
                if title.is_some() {
                    panel.title = title;
                }
                if layout.is_some() {
                    panel.layout = layout;
                }
                return Ok((PanelAction::Update, panel.clone()));
            }

            validate_id(&id)?;
            if let Some(existing) = state.panel(&id) {
                return Err(StoreError::AlreadyExists(format!(
                    "panel {id} (a {} panel)",
                    existing.kind.type_name()
                )));
            }
            let panel = Panel::new(id, kind).with_title(title).with_layout(layout);
            state.panels.push(panel.clone());
            Ok((PanelAction::Add, panel))
        };

        let store = &self.ctx.store;
        let workspace_id = &self.ctx.workspace_id;
        let (action, panel) = match document {
            Some(document) => store.save_document_with_ui(workspace_id, document, apply).await?,
            None => store.mutate_ui_state(workspace_id, apply).await?,
        };

        let data = document.map(to_value).transpose()?;
        self.emit(match action {
            PanelAction::Add => PanelUpdate::add(panel.clone(), data),
            _ => PanelUpdate::update(panel.clone(), data),
        });
        Ok(panel)
    }
}

fn expect_rows(value: Value, what: &str) -> Result<Vec<Value>, CapabilityError> {
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        _ => Err(CapabilityError::InvalidArgument(format!("{what} must be an array"))),
    }
}

fn string_option(options: &Map<String, Value>, key: &str) -> Option<String> {
    options.get(key).and_then(Value::as_str).map(String::from)
}

fn layout_option(options: &Map<String, Value>) -> Result<Option<PanelLayout>, CapabilityError> {
    match options.get("layout") {
        None | Some(Value::Null) => Ok(None),
        Some(layout) => serde_json::from_value(layout.clone())
            .map(Some)
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid layout: {e}"))),
    }
}

/// First string field for x, every numeric field for y.
fn infer_axes(rows: &[Value]) -> (Option<String>, Vec<String>) {
    let Some(Value::Object(first)) = rows.first() else {
        return (None, Vec::new());
    };
    let x_key = first
        .iter()
        .find(|(_, v)| v.is_string())
        .map(|(k, _)| k.clone());
    let y_keys = first
        .iter()
        .filter(|(_, v)| v.is_number())
        .map(|(k, _)| k.clone())
        .collect();
    (x_key, y_keys)
}
