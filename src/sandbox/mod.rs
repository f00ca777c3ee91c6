// src/sandbox/mod.rs
//
// Isolated execution of user-supplied scripts with the tool catalog bound
// as callable namespaces. Every invocation gets a fresh engine and scope —
// nothing survives between runs — with hard limits: a wall-clock deadline
// enforced by the engine's progress hook plus an outer watchdog, and size
// caps standing in for the memory ceiling. Scripts talk to the outside
// world only through the bound tool proxies and the egress-brokered fetch.

mod bindings;

use crate::catalog::CatalogSnapshot;
use crate::confirm::ConfirmationRouter;
use crate::egress::EgressPolicy;
use crate::error::Result;
use crate::index::FindResponse;
use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Slack the outer watchdog grants past the deadline before abandoning the
/// worker thread; the progress hook normally fires well inside it.
const WATCHDOG_MARGIN: Duration = Duration::from_millis(100);

/// Restricted handle the sandbox uses to reach back into the gateway. Only
/// data flows through here — the sandbox owns nothing of the dispatch
/// machinery, which is what keeps the plugin/orchestrator relationship
/// acyclic.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn catalog(&self) -> CatalogSnapshot;

    async fn call_tool(
        &self,
        provider: &str,
        tool: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value>;

    async fn find(&self, query: &str, limit: usize) -> Result<FindResponse>;
}

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_result_bytes: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            max_result_bytes: 1024 * 1024,
            // Size caps bound what a script can hold live; together they
            // stand in for the 64 MiB memory ceiling.
            max_string_size: 4 * 1024 * 1024,
            max_array_size: 64 * 1024,
            max_map_size: 64 * 1024,
            max_call_levels: 64,
        }
    }
}

/// Everything a finished invocation hands back.
#[derive(Debug, Clone)]
pub struct CodeOutcome {
    pub result: Option<Value>,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

pub struct Sandbox {
    invoker: Arc<dyn ToolInvoker>,
    confirm: Arc<ConfirmationRouter>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(invoker: Arc<dyn ToolInvoker>, confirm: Arc<ConfirmationRouter>) -> Self {
        Sandbox {
            invoker,
            confirm,
            limits: SandboxLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run one script. Never panics the gateway and never leaks internal
    /// state into the script: the outcome is a value, captured logs, and at
    /// most one error string.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> CodeOutcome {
        let timeout = timeout
            .unwrap_or(DEFAULT_TIMEOUT)
            .clamp(Duration::from_millis(1), MAX_TIMEOUT);
        let deadline = Instant::now() + timeout;

        let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let kill = Arc::new(AtomicBool::new(false));
        // Fresh per invocation: decision caches die with the run.
        let egress = Arc::new(EgressPolicy::new(self.confirm.clone()));
        let snapshot = self.invoker.catalog();
        let handle = tokio::runtime::Handle::current();

        let worker = {
            let code = code.to_string();
            let invoker = self.invoker.clone();
            let limits = self.limits.clone();
            let logs = logs.clone();
            let kill = kill.clone();
            tokio::task::spawn_blocking(move || {
                run_script(
                    &code, snapshot, invoker, egress, handle, logs, deadline, kill, &limits,
                )
            })
        };

        let outcome = tokio::select! {
            joined = worker => match joined {
                Ok(result) => result,
                Err(e) => Err(format!("SandboxError: execution panicked: {e}")),
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline + WATCHDOG_MARGIN)) => {
                kill.store(true, Ordering::Relaxed);
                Err(format!("SandboxError: timeout after {} ms", timeout.as_millis()))
            }
            _ = cancelled(cancel) => {
                kill.store(true, Ordering::Relaxed);
                Err("Cancelled: the caller aborted the run".to_string())
            }
        };

        let logs = logs.lock().map(|l| l.clone()).unwrap_or_default();
        match outcome {
            Ok(result) => CodeOutcome {
                result: Some(result),
                logs,
                error: None,
            },
            Err(error) => CodeOutcome {
                result: None,
                logs,
                error: Some(error),
            },
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_script(
    code: &str,
    snapshot: CatalogSnapshot,
    invoker: Arc<dyn ToolInvoker>,
    egress: Arc<EgressPolicy>,
    handle: tokio::runtime::Handle,
    logs: Arc<Mutex<Vec<String>>>,
    deadline: Instant,
    kill: Arc<AtomicBool>,
    limits: &SandboxLimits,
) -> std::result::Result<Value, String> {
    let mut engine = Engine::new();
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(128, 64);
    // No module loading: the provider namespaces below are all there is.
    engine.set_max_modules(0);
    engine.disable_symbol("eval");

    engine.on_progress(move |_| {
        if kill.load(Ordering::Relaxed) || Instant::now() >= deadline {
            Some(Dynamic::from("timeout"))
        } else {
            None
        }
    });

    {
        let logs = logs.clone();
        engine.on_print(move |text| {
            if let Ok(mut logs) = logs.lock() {
                logs.push(text.to_string());
            }
        });
    }
    {
        let logs = logs.clone();
        engine.on_debug(move |text, _source, pos| {
            if let Ok(mut logs) = logs.lock() {
                logs.push(format!("[debug {pos}] {text}"));
            }
        });
    }

    bindings::bind_catalog(&mut engine, &snapshot, &invoker, &handle, deadline);
    bindings::bind_act(&mut engine, &snapshot, &invoker, &handle, deadline);
    bindings::bind_fetch(&mut engine, &egress, &handle, deadline);

    match engine.eval::<Dynamic>(code) {
        Ok(value) => Ok(shape_result(value, limits.max_result_bytes)),
        Err(err) => Err(describe_error(*err)),
    }
}

/// The script's final expression, serialized to JSON under the result cap.
fn shape_result(value: Dynamic, cap: usize) -> Value {
    let json = match rhai::serde::from_dynamic::<Value>(&value) {
        Ok(json) => json,
        // Function pointers and other engine-only types fall back to text.
        Err(_) => Value::String(value.to_string()),
    };
    let size = json.to_string().len();
    if size > cap {
        debug!("sandbox result of {size} bytes exceeds cap {cap}");
        Value::String(format!(
            "[result truncated: {size} bytes exceeds the {cap} byte cap]"
        ))
    } else {
        json
    }
}

/// One stable line per failure. Host-side errors arrive as
/// `Kind: message` runtime throws from the bindings; engine terminations
/// become timeouts; everything else is the script's own error text.
fn describe_error(err: EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorTerminated(_, _) => "SandboxError: timeout".to_string(),
        EvalAltResult::ErrorRuntime(payload, _) => {
            let text = payload.to_string();
            if text.contains(':') {
                text
            } else {
                format!("SandboxError: {text}")
            }
        }
        other => format!("SandboxError: {other}"),
    }
}
