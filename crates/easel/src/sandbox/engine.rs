//! QuickJS execution of one snippet.
//!
//! Each invocation gets a brand new runtime and context on a dedicated
//! thread. The thread runs its own current-thread tokio runtime so the
//! capability futures (store, fetch, timers) can run next to the
//! non-`Send` JS values that await them.
//!
//! Time is bounded by a single [`Deadline`] shared with the QuickJS
//! interrupt handler. It starts at the script timeout, which covers the
//! synchronous part of the snippet, and is pushed out to the async timeout
//! once the snippet yields its promise.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rquickjs::prelude::Async;
use rquickjs::{AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Ctx, Function, Promise, async_with};
use serde_json::Value;
use tokio::sync::oneshot;

use super::SandboxError;
use super::host::Host;
use crate::limits::SandboxLimits;

const PRELUDE: &str = include_str!("prelude.js");

/// Extra time the caller waits for the engine thread beyond the async
/// timeout before giving up on it.
const THREAD_GRACE: Duration = Duration::from_secs(5);

/// Which limit a snippet ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The synchronous part ran past the script timeout.
    Script,
    /// The returned promise did not settle within the async timeout.
    Async,
}

/// How a snippet ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScriptResult {
    /// Completed; `None` when the snippet returned `undefined`.
    Returned(Option<Value>),
    /// Threw; the message as the snippet would print it.
    Threw(String),
    /// Hit a time limit.
    TimedOut(TimeoutKind),
}

/// Moving time limit, measured from when the invocation started.
#[derive(Debug)]
struct Deadline {
    start: Instant,
    limit_ms: AtomicU64,
}

impl Deadline {
    fn new(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit_ms: AtomicU64::new(limit.as_millis() as u64),
        }
    }

    fn set(&self, limit: Duration) {
        self.limit_ms.store(limit.as_millis() as u64, Ordering::Relaxed);
    }

    fn limit(&self) -> Duration {
        Duration::from_millis(self.limit_ms.load(Ordering::Relaxed))
    }

    fn expired(&self) -> bool {
        self.start.elapsed() >= self.limit()
    }

    fn remaining(&self) -> Duration {
        self.limit().saturating_sub(self.start.elapsed())
    }
}

/// Run `code` against `host` and wait for it to settle.
pub(crate) async fn run(host: Arc<Host>, code: &str, limits: &SandboxLimits) -> Result<ScriptResult, SandboxError> {
    let (tx, rx) = oneshot::channel();
    let source = wrap_snippet(code);
    let thread_limits = limits.clone();

    std::thread::Builder::new()
        .name("easel-js".to_string())
        .spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| SandboxError::Setup(format!("failed to start engine runtime: {e}")))
                .and_then(|rt| rt.block_on(evaluate(host, source, thread_limits)));
            let _ = tx.send(result);
        })
        .map_err(|e| SandboxError::Setup(format!("failed to spawn engine thread: {e}")))?;

    match tokio::time::timeout(limits.async_timeout + THREAD_GRACE, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(SandboxError::Engine("engine thread exited without a result".to_string())),
        Err(_) => {
            tracing::warn!("engine thread did not finish within the grace period");
            Ok(ScriptResult::TimedOut(TimeoutKind::Async))
        }
    }
}

async fn evaluate(host: Arc<Host>, source: String, limits: SandboxLimits) -> Result<ScriptResult, SandboxError> {
    let deadline = Arc::new(Deadline::new(limits.script_timeout));

    let runtime = AsyncRuntime::new().map_err(|e| SandboxError::Setup(e.to_string()))?;
    runtime.set_memory_limit(limits.max_memory_bytes as usize).await;
    runtime.set_max_stack_size(limits.max_stack_bytes as usize).await;
    let watchdog = deadline.clone();
    runtime
        .set_interrupt_handler(Some(Box::new(move || watchdog.expired())))
        .await;
    let context = AsyncContext::full(&runtime)
        .await
        .map_err(|e| SandboxError::Setup(e.to_string()))?;

    let async_timeout = limits.async_timeout;
    async_with!(context => |ctx| {
        if let Err(e) = install_bridge(&ctx, host) {
            return Err(SandboxError::Setup(format!("failed to install host bridge: {e}")));
        }
        if let Err(e) = ctx.eval::<(), _>(PRELUDE).catch(&ctx) {
            return Err(SandboxError::Setup(format!("prelude failed: {}", describe(&e))));
        }

        // An interrupt inside an async body rejects its promise instead of
        // failing the eval, so the deadline is the source of truth here.
        let evaluated = ctx.eval::<Promise, _>(source).catch(&ctx);
        if deadline.expired() {
            tracing::debug!("script interrupted");
            return Ok(ScriptResult::TimedOut(TimeoutKind::Script));
        }
        let promise = match evaluated {
            Ok(promise) => promise,
            Err(e) => return Ok(ScriptResult::Threw(describe(&e))),
        };

        deadline.set(async_timeout);
        match tokio::time::timeout(deadline.remaining(), promise.into_future::<String>()).await {
            Err(_) => Ok(ScriptResult::TimedOut(TimeoutKind::Async)),
            Ok(Err(_)) if deadline.expired() => Ok(ScriptResult::TimedOut(TimeoutKind::Async)),
            Ok(Err(e)) => Ok(ScriptResult::Threw(describe(&CaughtError::from_error(&ctx, e)))),
            Ok(Ok(reply)) => Ok(decode(&reply)),
        }
    })
    .await
}

fn install_bridge(ctx: &Ctx<'_>, host: Arc<Host>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let sync_host = host.clone();
    let host_sync = Function::new(ctx.clone(), move |name: String, args: String| {
        sync_host.dispatch_sync(&name, &args)
    })?;
    globals.set("__hostSync", host_sync)?;

    let host_call = Function::new(
        ctx.clone(),
        Async(move |name: String, args: String| {
            let host = host.clone();
            async move { host.dispatch(&name, &args).await }
        }),
    )?;
    globals.set("__hostCall", host_call)?;
    Ok(())
}

fn describe(error: &CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_default();
            match exception.get::<_, String>("name") {
                Ok(name) if !name.is_empty() => format!("{name}: {message}"),
                _ => message,
            }
        }
        other => other.to_string(),
    }
}

/// Wrap the snippet so it may use top-level `await` and `return`, and so
/// whatever it produces comes back as one JSON string.
fn wrap_snippet(code: &str) -> String {
    format!(
        r#"(async () => {{
  let __result;
  try {{
    __result = await (async () => {{
{code}
    }})();
  }} catch (e) {{
    return JSON.stringify({{ ok: false, error: e instanceof Error ? e.message : String(e) }});
  }}
  if (__result === undefined) return '{{"ok":true,"undefined":true}}';
  try {{
    return JSON.stringify({{ ok: true, value: __result }});
  }} catch (e) {{
    return JSON.stringify({{ ok: false, error: 'return value is not serializable: ' + e.message }});
  }}
}})()"#
    )
}

fn decode(reply: &str) -> ScriptResult {
    let Ok(Value::Object(mut envelope)) = serde_json::from_str::<Value>(reply) else {
        return ScriptResult::Threw(format!("malformed snippet result: {reply}"));
    };

    if envelope.get("ok").and_then(Value::as_bool) != Some(true) {
        let message = envelope
            .remove("error")
            .and_then(|e| e.as_str().map(String::from))
            .unwrap_or_else(|| "unknown error".to_string());
        return ScriptResult::Threw(message);
    }
    if envelope.get("undefined").and_then(Value::as_bool) == Some(true) {
        return ScriptResult::Returned(None);
    }
    ScriptResult::Returned(Some(envelope.remove("value").unwrap_or(Value::Null)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_moves() {
        let deadline = Deadline::new(Duration::ZERO);
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);

        deadline.set(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.remaining() > Duration::from_secs(59));
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode(r#"{"ok":true,"value":[1,2]}"#),
            ScriptResult::Returned(Some(serde_json::json!([1, 2])))
        );
        assert_eq!(decode(r#"{"ok":true,"undefined":true}"#), ScriptResult::Returned(None));
        assert_eq!(decode(r#"{"ok":true}"#), ScriptResult::Returned(Some(Value::Null)));
        assert_eq!(
            decode(r#"{"ok":false,"error":"boom"}"#),
            ScriptResult::Threw("boom".into())
        );
        assert!(matches!(decode("nope"), ScriptResult::Threw(_)));
    }

    #[test]
    fn test_wrap_snippet_keeps_code() {
        let wrapped = wrap_snippet("return 1 + 1;");
        assert!(wrapped.contains("\nreturn 1 + 1;\n"));
        assert!(wrapped.starts_with("(async () =>"));
    }
}
