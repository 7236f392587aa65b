//! Host side of the capability bridge.
//!
//! The JS prelude calls into two functions: an async one for capabilities
//! that touch storage or the network, and a sync one for pure helpers.
//! Both take a capability name plus a JSON array of arguments and answer
//! with `{"ok": value}` or `{"error": message}`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use super::files::FileArea;
use super::net::{self, FetchRequest, Resolver};
use super::{CapabilityError, skills, transform};
use crate::limits::{LimitedBuffer, SandboxLimits};
use crate::panel::{PanelUpdate, PanelUpdateQueue};
use crate::store::WorkspaceStore;

/// Everything a sandbox needs that outlives one invocation.
pub(crate) struct SandboxContext {
    pub(crate) workspace_id: String,
    pub(crate) store: WorkspaceStore,
    pub(crate) limits: SandboxLimits,
    pub(crate) files: FileArea,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) skills_dir: Option<PathBuf>,
    pub(crate) env_allowlist: HashSet<String>,
}

/// State for one `execute` call. A fresh one is built per invocation, so
/// logs and updates never leak into the next snippet.
pub(crate) struct Host {
    pub(crate) ctx: Arc<SandboxContext>,
    queue: Option<PanelUpdateQueue>,
    logs: Mutex<LimitedBuffer>,
    updates: Mutex<Vec<PanelUpdate>>,
}

impl Host {
    pub(crate) fn new(ctx: Arc<SandboxContext>, queue: Option<PanelUpdateQueue>) -> Self {
        let log_limit = ctx.limits.max_log_bytes as usize;
        Self {
            ctx,
            queue,
            logs: Mutex::new(LimitedBuffer::new(log_limit)),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Captured `log` output so far.
    pub(crate) fn logs(&self) -> String {
        self.logs.lock().as_str().to_string()
    }

    /// Updates produced so far, in order.
    pub(crate) fn updates(&self) -> Vec<PanelUpdate> {
        self.updates.lock().clone()
    }

    /// Record an update and stream it to the consumer when one is attached.
    pub(crate) fn emit(&self, update: PanelUpdate) {
        tracing::debug!(
            workspace_id = %self.ctx.workspace_id,
            panel_id = %update.panel.id,
            action = ?update.action,
            "panel update"
        );
        if let Some(queue) = &self.queue {
            queue.push(update.clone());
        }
        self.updates.lock().push(update);
    }

    /// Entry point for the async bridge function.
    pub(crate) async fn dispatch(&self, name: &str, args: &str) -> String {
        let result = match Args::from_raw(args) {
            Ok(args) => self.call(name, args).await,
            Err(e) => Err(e),
        };
        envelope(name, result)
    }

    /// Entry point for the sync bridge function.
    pub(crate) fn dispatch_sync(&self, name: &str, args: &str) -> String {
        let result = Args::from_raw(args).and_then(|args| self.call_sync(name, args));
        envelope(name, result)
    }

    async fn call(&self, name: &str, args: Args) -> Result<Value, CapabilityError> {
        let ctx = &self.ctx;
        match name {
            "read" => self.read(&args.string(0, "source")?).await,
            "write" => self.write(args.value(0), &args.string(1, "destination")?).await,

            "setTable" => self.set_table(&args.string(0, "id")?, args.object(1)?).await,
            "setChart" => self.set_chart(&args.string(0, "id")?, args.object(1)?).await,
            "setCards" => self.set_cards(&args.string(0, "id")?, args.object(1)?).await,
            "setMarkdown" => {
                self.set_markdown(&args.string(0, "id")?, &args.string(1, "content")?, args.object(2)?)
                    .await
            }
            "setPdf" => {
                self.set_pdf(&args.string(0, "id")?, &args.string(1, "path")?, args.object(2)?)
                    .await
            }
            "addPanel" => self.add_panel(args.object(0)?).await,
            "removePanel" => self.remove_panel(&args.string(0, "id")?).await,
            "updatePanel" => self.update_panel(&args.string(0, "id")?, &args.value(1)).await,
            "movePanel" => self.move_panel(&args.string(0, "id")?, args.parse(1, "layout")?).await,

            "fetch" => {
                let request: FetchRequest = args.parse_or_default(1)?;
                let response = net::fetch(
                    &args.string(0, "url")?,
                    request,
                    ctx.resolver.as_ref(),
                    ctx.limits.fetch_timeout,
                    ctx.limits.max_fetch_bytes as usize,
                )
                .await?;
                to_value(response)
            }
            "listSkills" => to_value(skills::list_skills(ctx.skills_dir.as_deref()).await?),
            "readSkill" => Ok(Value::String(
                skills::read_skill(ctx.skills_dir.as_deref(), &args.string(0, "name")?).await?,
            )),

            "download" => {
                let path = ctx.files.download(&args.value(0), &args.string(1, "filename")?).await?;
                Ok(Value::String(path))
            }
            "setWorkspaceInfo" => {
                let info = args.object(0)?;
                let name = info.get("name").and_then(Value::as_str);
                let description = info.get("description").and_then(Value::as_str);
                let workspace = ctx
                    .store
                    .update_workspace_info(&ctx.workspace_id, name, description)
                    .await?;
                to_value(workspace)
            }
            "glob" => to_value(ctx.files.glob(&args.string(0, "pattern")?).await?),
            "search" => {
                let options = args.object(1)?;
                let file_glob = options.get("glob").and_then(Value::as_str);
                to_value(ctx.files.search(&args.string(0, "pattern")?, file_glob).await?)
            }
            "edit" => {
                let path = ctx
                    .files
                    .edit(
                        &args.string(0, "path")?,
                        &args.string(1, "old text")?,
                        &args.string(2, "new text")?,
                    )
                    .await?;
                Ok(Value::String(path))
            }
            "listFiles" => to_value(ctx.files.list(&args.opt_string(0).unwrap_or_default()).await?),
            "deleteFile" => Ok(Value::String(ctx.files.delete(&args.string(0, "path")?).await?)),

            "sleep" => {
                let requested = args.value(0).as_f64().unwrap_or(0.0).max(0.0);
                let delay = Duration::from_millis(requested as u64).min(ctx.limits.max_timer_delay);
                tokio::time::sleep(delay).await;
                Ok(Value::Null)
            }

            other => Err(CapabilityError::UnknownCapability(other.to_string())),
        }
    }

    fn call_sync(&self, name: &str, args: Args) -> Result<Value, CapabilityError> {
        let ctx = &self.ctx;
        match name {
            "filter" => to_value(transform::filter(&args.rows(0)?, &args.string(1, "expression")?)?),
            "pick" => to_value(transform::pick(&args.rows(0)?, &args.parse::<Vec<String>>(1, "fields")?)),
            "sort" => {
                let direction = args.opt_string(2).unwrap_or_else(|| "asc".to_string());
                to_value(transform::sort(&args.rows(0)?, &args.string(1, "field")?, &direction)?)
            }
            "map" => to_value(transform::map(&args.rows(0)?, &args.object(1)?)?),
            "unique" => to_value(transform::unique(&args.rows(0)?, args.opt_string(1).as_deref())),
            "group" => Ok(transform::group(&args.rows(0)?, &args.string(1, "field")?)),

            "env" => {
                let key = args.string(0, "key")?;
                if !ctx.env_allowlist.contains(&key) {
                    return Err(CapabilityError::EnvNotAllowed(key));
                }
                Ok(std::env::var(&key).map(Value::String).unwrap_or(Value::Null))
            }
            "log" => {
                self.logs.lock().push_line(&args.opt_string(0).unwrap_or_default());
                Ok(Value::Null)
            }
            "getFilePath" => {
                let resolved = ctx.files.resolve(&args.string(0, "path")?)?;
                Ok(Value::String(resolved.host.to_string_lossy().into_owned()))
            }
            "getWorkspaceDir" => Ok(Value::String(ctx.files.root().to_string_lossy().into_owned())),

            "btoa" => {
                let text = args.string(0, "data")?;
                let bytes = text
                    .chars()
                    .map(|c| u8::try_from(u32::from(c)))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| {
                        CapabilityError::InvalidArgument(
                            "btoa: string contains characters outside Latin-1".to_string(),
                        )
                    })?;
                Ok(Value::String(STANDARD.encode(bytes)))
            }
            "atob" => {
                let encoded: String = args
                    .string(0, "data")?
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                let bytes = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| CapabilityError::InvalidArgument(format!("atob: {e}")))?;
                Ok(Value::String(bytes.into_iter().map(char::from).collect()))
            }
            "utf8Encode" => to_value(args.string(0, "text")?.into_bytes()),
            "utf8Decode" => {
                let bytes: Vec<u8> = args.parse(0, "bytes")?;
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
            "urlParse" => parse_url(&args.string(0, "url")?, args.opt_string(1).as_deref()),

            other => Err(CapabilityError::UnknownCapability(other.to_string())),
        }
    }
}

fn envelope(name: &str, result: Result<Value, CapabilityError>) -> String {
    let reply = match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => {
            tracing::debug!(capability = name, error = %e, "capability failed");
            json!({ "error": e.to_string() })
        }
    };
    reply.to_string()
}

pub(crate) fn to_value<T: serde::Serialize>(value: T) -> Result<Value, CapabilityError> {
    serde_json::to_value(value).map_err(|e| CapabilityError::InvalidArgument(e.to_string()))
}

fn parse_url(href: &str, base: Option<&str>) -> Result<Value, CapabilityError> {
    let base = base
        .map(url::Url::parse)
        .transpose()
        .map_err(|e| CapabilityError::InvalidArgument(format!("Invalid base URL: {e}")))?;
    let url = url::Url::options()
        .base_url(base.as_ref())
        .parse(href)
        .map_err(|e| CapabilityError::InvalidArgument(format!("Invalid URL {href:?}: {e}")))?;

    let hostname = url.host_str().unwrap_or_default().to_string();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{hostname}:{port}")
    };

    Ok(json!({
        "base": &url[..url::Position::AfterPath],
        "search": url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        "hash": url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        "protocol": format!("{}:", url.scheme()),
        "username": url.username(),
        "password": url.password().unwrap_or_default(),
        "hostname": hostname,
        "port": port,
        "host": host,
        "pathname": url.path(),
        "origin": url.origin().ascii_serialization(),
    }))
}

/// Positional arguments from the bridge.
pub(crate) struct Args(Vec<Value>);

impl Args {
    fn from_raw(raw: &str) -> Result<Self, CapabilityError> {
        serde_json::from_str(raw)
            .map(Self)
            .map_err(|e| CapabilityError::InvalidArgument(format!("malformed arguments: {e}")))
    }

    /// Argument `i`, `null` when absent.
    pub(crate) fn value(&self, i: usize) -> Value {
        self.0.get(i).cloned().unwrap_or(Value::Null)
    }

    pub(crate) fn string(&self, i: usize, what: &str) -> Result<String, CapabilityError> {
        match self.0.get(i) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(CapabilityError::InvalidArgument(format!("{what} must be a string"))),
        }
    }

    pub(crate) fn opt_string(&self, i: usize) -> Option<String> {
        match self.0.get(i) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Argument `i` as an object; absent or `null` is an empty object.
    pub(crate) fn object(&self, i: usize) -> Result<Map<String, Value>, CapabilityError> {
        match self.0.get(i) {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(CapabilityError::InvalidArgument(format!(
                "argument {} must be an object",
                i + 1
            ))),
        }
    }

    pub(crate) fn rows(&self, i: usize) -> Result<Vec<Value>, CapabilityError> {
        match self.0.get(i) {
            Some(Value::Array(rows)) => Ok(rows.clone()),
            _ => Err(CapabilityError::InvalidArgument("rows must be an array".to_string())),
        }
    }

    pub(crate) fn parse<T: DeserializeOwned>(&self, i: usize, what: &str) -> Result<T, CapabilityError> {
        serde_json::from_value(self.value(i))
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid {what}: {e}")))
    }

    fn parse_or_default<T: DeserializeOwned + Default>(&self, i: usize) -> Result<T, CapabilityError> {
        match self.0.get(i) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| CapabilityError::InvalidArgument(format!("invalid options: {e}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::AllowAllPolicy;
    use crate::sandbox::net::StaticResolver;

    fn host(dir: &tempfile::TempDir) -> Host {
        let store = WorkspaceStore::new(dir.path(), Duration::from_secs(5));
        let files = FileArea::new(store.files_dir("ws").unwrap(), Arc::new(AllowAllPolicy));
        let ctx = SandboxContext {
            workspace_id: "ws".into(),
            store,
            limits: SandboxLimits::default(),
            files,
            resolver: Arc::new(StaticResolver::new()),
            skills_dir: None,
            env_allowlist: ["EASEL_TEST_VAR".to_string()].into_iter().collect(),
        };
        Host::new(Arc::new(ctx), None)
    }

    fn reply(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_env_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(&dir);

        let denied = reply(&host.dispatch_sync("env", r#"["HOME"]"#));
        assert!(denied["error"].as_str().unwrap().contains("HOME"));

        let allowed = reply(&host.dispatch_sync("env", r#"["EASEL_TEST_VAR"]"#));
        assert!(allowed.get("ok").is_some());
    }

    #[test]
    fn test_base64_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(&dir);

        assert_eq!(reply(&host.dispatch_sync("btoa", r#"["hello"]"#))["ok"], "aGVsbG8=");
        assert_eq!(reply(&host.dispatch_sync("atob", r#"["aGVsbG8="]"#))["ok"], "hello");
        assert!(reply(&host.dispatch_sync("btoa", r#"["✓"]"#)).get("error").is_some());
    }

    #[test]
    fn test_url_parse() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(&dir);

        let parts = reply(&host.dispatch_sync(
            "urlParse",
            r#"["/search?q=rust#top", "https://example.com:8443/base"]"#,
        ))["ok"]
            .clone();
        assert_eq!(parts["base"], "https://example.com:8443/search");
        assert_eq!(parts["search"], "?q=rust");
        assert_eq!(parts["hash"], "#top");
        assert_eq!(parts["host"], "example.com:8443");
        assert_eq!(parts["origin"], "https://example.com:8443");
    }

    #[test]
    fn test_log_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(&dir);

        host.dispatch_sync("log", r#"["first"]"#);
        host.dispatch_sync("log", r#"["second"]"#);
        assert_eq!(host.logs(), "first\nsecond\n");
    }

    #[test]
    fn test_typed_argument_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(&dir);

        let picked = reply(&host.dispatch_sync("pick", r#"[[{"a": 1, "b": 2}], ["a"]]"#));
        assert_eq!(picked["ok"], serde_json::json!([{"a": 1}]));

        let err = reply(&host.dispatch_sync("pick", r#"[[{"a": 1}], "a"]"#));
        assert!(err["error"].as_str().unwrap().contains("fields"), "{err}");
    }

    #[test]
    fn test_unknown_capability() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(&dir);

        let err = reply(&host.dispatch_sync("spawn", "[]"));
        assert!(err["error"].as_str().unwrap().contains("spawn"));
        let err = reply(&host.dispatch_sync("log", "not json"));
        assert!(err["error"].as_str().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_sleep_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = host(&dir);
        if let Some(ctx) = Arc::get_mut(&mut host.ctx) {
            ctx.limits.max_timer_delay = Duration::from_millis(10);
        }

        let started = std::time::Instant::now();
        host.dispatch("sleep", "[60000]").await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
