// src/server.rs
//
// The inbound MCP endpoint. One reader loop, one writer task; requests are
// answered in spawned tasks (so a slow downstream never blocks the wire),
// responses from the host (elicitation answers) are correlated back to the
// outbound pending map. The tool surface the host sees is synthesized:
// find/run/code depending on the configured mode, never the raw child
// tools.

use crate::aggregator::MCPAggregator;
use crate::catalog::{split_qualified_name, validate_params, CatalogSnapshot};
use crate::codec::{
    decode_frame, encode_request, encode_response, FrameReader, IdSequence, RpcFrame, RpcResponse,
};
use crate::config::SurfaceMode;
use crate::confirm::{Confirmation, ConfirmationChannel};
use crate::error::{GatewayError, Result};
use crate::index::{FindFilters, SemanticIndex};
use crate::sandbox::{Sandbox, ToolInvoker};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const ELICITATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared sender side of the wire plus the id space for gateway-initiated
/// requests (elicitation). A single writer task makes frame emission atomic.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<String>,
    ids: Arc<IdSequence>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
}

impl Outbound {
    fn send_raw(&self, frame: String) {
        if self.tx.send(frame).is_err() {
            debug!("writer gone; dropping outbound frame");
        }
    }

    fn send_response(&self, response: RpcResponse) {
        self.send_raw(encode_response(&response));
    }

    /// Server-to-host request, correlated by our own id space.
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<RpcResponse> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        self.send_raw(encode_request(id, method, Some(params)));

        let outcome = tokio::time::timeout(timeout, rx).await;
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::Internal("host connection lost".to_string())),
            Err(_) => Err(GatewayError::Timeout),
        }
    }
}

/// Elicitation-backed confirmation channel, installed once the host's
/// `initialize` declares the capability.
struct ElicitationChannel {
    outbound: Outbound,
}

#[async_trait]
impl ConfirmationChannel for ElicitationChannel {
    async fn confirm(&self, message: &str, schema: Value) -> Result<Confirmation> {
        let params = json!({
            "message": message,
            "requestedSchema": schema,
        });
        let response = self
            .outbound
            .request("elicitation/input", params, ELICITATION_TIMEOUT)
            .await?;

        if let Some(err) = response.error {
            warn!("elicitation request failed: {}", err.message);
            return Ok(Confirmation::Decline);
        }
        let result = response.result.unwrap_or(Value::Null);
        match result.get("action").and_then(Value::as_str) {
            Some("accept") => Ok(Confirmation::Accept(result.get("content").cloned())),
            Some("decline") => Ok(Confirmation::Decline),
            Some("cancel") => Ok(Confirmation::Cancel),
            _ => Ok(Confirmation::Decline),
        }
    }
}

/// The restricted handle handed to the sandbox: tool calls and find only,
/// no dispatch machinery.
struct GatewayInvoker {
    aggregator: Arc<MCPAggregator>,
    index: Arc<SemanticIndex>,
}

#[async_trait]
impl ToolInvoker for GatewayInvoker {
    fn catalog(&self) -> CatalogSnapshot {
        self.aggregator.catalog().snapshot()
    }

    async fn call_tool(
        &self,
        provider: &str,
        tool: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        self.aggregator
            .call_tool(provider, tool, params, deadline, None)
            .await
    }

    async fn find(&self, query: &str, limit: usize) -> Result<crate::index::FindResponse> {
        let snapshot = self.aggregator.get_tools().await;
        self.index
            .query(&snapshot, query, limit, &FindFilters::default())
            .await
    }
}

pub struct GatewayServer {
    aggregator: Arc<MCPAggregator>,
    index: Arc<SemanticIndex>,
    mode: SurfaceMode,
    protocol_version: String,
    sandbox: Option<Sandbox>,
    initialized: AtomicBool,
    outbound: Outbound,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Cancel token per in-flight inbound request, keyed by the request id's
    /// JSON text; `notifications/cancelled` and disconnects trigger them.
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl GatewayServer {
    pub fn new(
        aggregator: Arc<MCPAggregator>,
        index: Arc<SemanticIndex>,
        mode: SurfaceMode,
        protocol_version: String,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound {
            tx,
            ids: Arc::new(IdSequence::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        };

        let sandbox = if mode.has_code() {
            Some(Sandbox::new(
                Arc::new(GatewayInvoker {
                    aggregator: aggregator.clone(),
                    index: index.clone(),
                }),
                aggregator.confirmations(),
            ))
        } else {
            None
        };

        Arc::new(GatewayServer {
            aggregator,
            index,
            mode,
            protocol_version,
            sandbox,
            initialized: AtomicBool::new(false),
            outbound,
            outbound_rx: Mutex::new(Some(rx)),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Serve MCP over stdio until the host closes the stream.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Serve MCP over arbitrary byte streams (tests drive this with
    /// in-memory pipes).
    pub async fn run_with_io<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(mode = ?self.mode, "MCP server starting over stdio");

        let mut rx = self
            .outbound_rx
            .lock()
            .map_err(|_| GatewayError::Internal("outbound receiver lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| GatewayError::Internal("server already running".to_string()))?;

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut frames = FrameReader::new(reader);
        loop {
            match frames.next_line().await {
                Ok(Some(line)) => self.clone().dispatch_line(line).await,
                Ok(None) => {
                    info!("end of input, shutting down");
                    break;
                }
                Err(GatewayError::Parse(message)) => {
                    // Oversize or broken line: answer and keep serving.
                    warn!("inbound parse failure: {message}");
                    self.outbound.send_response(RpcResponse::from_gateway_error(
                        Value::Null,
                        &GatewayError::Parse(message),
                    ));
                }
                Err(e) => {
                    error!("inbound stream failed: {e}");
                    break;
                }
            }
        }

        // Host is gone: abort whatever is still running on its behalf.
        if let Ok(cancels) = self.cancels.lock() {
            for token in cancels.values() {
                token.cancel();
            }
        }
        writer_task.abort();
        Ok(())
    }

    async fn dispatch_line(self: Arc<Self>, line: String) {
        debug!("received frame: {line}");
        match decode_frame(&line) {
            Ok(RpcFrame::Request { id, method, params }) => {
                self.dispatch_request(id, method, params).await;
            }
            Ok(RpcFrame::Notification { method, params }) => {
                self.handle_notification(&method, params);
            }
            Ok(RpcFrame::Response(response)) => {
                self.route_host_response(response);
            }
            Err(e) => {
                self.outbound
                    .send_response(RpcResponse::from_gateway_error(Value::Null, &e));
            }
        }
    }

    fn route_host_response(&self, response: RpcResponse) {
        let Some(id) = response.id.as_u64() else {
            debug!("host response with non-integer id ignored");
            return;
        };
        let waiter = self
            .outbound
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&id));
        if let Some(tx) = waiter {
            let _ = tx.send(response);
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "notifications/initialized" => debug!("host confirmed initialization"),
            "notifications/cancelled" => {
                let key = params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .map(Value::to_string);
                if let Some(key) = key {
                    if let Ok(cancels) = self.cancels.lock() {
                        if let Some(token) = cancels.get(&key) {
                            info!("cancelling in-flight request {key}");
                            token.cancel();
                        }
                    }
                }
            }
            other => debug!("ignoring notification: {other}"),
        }
    }

    async fn dispatch_request(self: Arc<Self>, id: Value, method: String, params: Option<Value>) {
        // initialize is answered inline and never waits on the catalog.
        if method == "initialize" {
            let response = match self.handle_initialize(params).await {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => RpcResponse::from_gateway_error(id, &e),
            };
            self.outbound.send_response(response);
            return;
        }

        if !self.initialized.load(Ordering::SeqCst) {
            self.outbound.send_response(RpcResponse::from_gateway_error(
                id,
                &GatewayError::NotInitialized,
            ));
            return;
        }

        match method.as_str() {
            "ping" => {
                self.outbound
                    .send_response(RpcResponse::success(id, json!({})));
            }
            "tools/list" => {
                let result = json!({ "tools": self.surface_tools() });
                self.outbound
                    .send_response(RpcResponse::success(id, result));
            }
            "tools/call" => {
                // Answered in a spawned task: a slow downstream must not
                // stall the reader loop.
                let server = self.clone();
                let key = id.to_string();
                let token = CancellationToken::new();
                if let Ok(mut cancels) = server.cancels.lock() {
                    cancels.insert(key.clone(), token.clone());
                }
                tokio::spawn(async move {
                    let response = match server.handle_tool_call(params, &token).await {
                        Ok(result) => RpcResponse::success(id, result),
                        Err(e) => RpcResponse::from_gateway_error(id, &e),
                    };
                    if let Ok(mut cancels) = server.cancels.lock() {
                        cancels.remove(&key);
                    }
                    server.outbound.send_response(response);
                });
            }
            other => {
                debug!("method not found: {other}");
                self.outbound
                    .send_response(RpcResponse::method_not_found(id));
            }
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> Result<Value> {
        let supports_elicitation = params
            .as_ref()
            .and_then(|p| p.pointer("/capabilities/elicitation"))
            .is_some();
        if supports_elicitation {
            self.aggregator
                .confirmations()
                .set_preferred(Arc::new(ElicitationChannel {
                    outbound: self.outbound.clone(),
                }))
                .await;
            debug!("host supports elicitation");
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(json!({
            "protocolVersion": self.protocol_version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": "funnel-mcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }))
    }

    /// The synthesized tool surface for the configured mode.
    fn surface_tools(&self) -> Vec<Value> {
        let mut tools = Vec::new();
        if self.mode.has_find() {
            tools.push(json!({
                "name": "find",
                "description": "Discover tools across all connected MCP servers by describing what you want to do.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "description": {
                            "type": "string",
                            "description": "What you want to accomplish, in plain language"
                        },
                        "limit": {
                            "type": "integer", "minimum": 1, "maximum": 50, "default": 10
                        },
                        "filters": {
                            "type": "object",
                            "properties": {
                                "providers": {"type": "array", "items": {"type": "string"}},
                                "substring": {"type": "string"}
                            }
                        }
                    },
                    "required": ["description"]
                }
            }));
        }
        if self.mode.has_run() {
            tools.push(json!({
                "name": "run",
                "description": "Execute a tool by its qualified name (provider:tool), as returned by find.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "tool": {"type": "string", "description": "Qualified name, e.g. github:search_code"},
                        "parameters": {"type": "object"},
                        "timeoutMs": {"type": "integer", "minimum": 1, "maximum": 300000},
                        "skipValidation": {"type": "boolean"}
                    },
                    "required": ["tool"]
                }
            }));
        }
        if self.mode.has_code() {
            tools.push(json!({
                "name": "code",
                "description": "Run a script with every connected tool callable as provider::tool(#{...}); also provides act(intent, context) and a policied fetch(url).",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "code": {"type": "string"},
                        "timeout": {"type": "integer", "minimum": 1, "maximum": 300000}
                    },
                    "required": ["code"]
                }
            }));
        }
        tools
    }

    async fn handle_tool_call(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let params =
            params.ok_or_else(|| GatewayError::InvalidRequest("params are required".to_string()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidRequest("missing 'name'".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let result = match name {
            "find" if self.mode.has_find() => self.handle_find(&arguments).await?,
            "run" if self.mode.has_run() => self.handle_run(&arguments, cancel).await?,
            "code" if self.mode.has_code() => self.handle_code(&arguments, cancel).await?,
            other => return Err(GatewayError::ToolNotFound(other.to_string())),
        };

        // MCP tool results carry content blocks; ours is one JSON text blob.
        Ok(json!({
            "content": [{"type": "text", "text": result.to_string()}],
            "structuredContent": result,
        }))
    }

    async fn handle_find(&self, args: &Value) -> Result<Value> {
        let description = args
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::InvalidRequest("find requires a 'description'".to_string())
            })?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l.min(50) as usize)
            .unwrap_or(10);
        let filters = FindFilters {
            providers: args
                .pointer("/filters/providers")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                }),
            substring: args
                .pointer("/filters/substring")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        let snapshot = self.aggregator.get_tools().await;

        // Warm-up has produced nothing yet: say so instead of a blank list.
        if self.index.indexed() == 0 {
            return Ok(json!({
                "matches": [],
                "total": 0,
                "indexingInProgress": !snapshot.is_empty(),
                "indexed": 0,
                "totalTools": snapshot.len(),
                "message": if snapshot.is_empty() {
                    "No tools are connected yet. Check the active profile's providers."
                } else {
                    "The semantic index is still warming up; try again in a moment."
                },
            }));
        }

        let found = self
            .index
            .query(&snapshot, description, limit, &filters)
            .await?;
        let matches: Vec<Value> = found
            .matches
            .iter()
            .map(|m| {
                json!({
                    "qualifiedName": m.qualified_name,
                    "score": m.score,
                    "provider": m.provider,
                    "title": m.title,
                    "description": m.description,
                    "available": m.available,
                })
            })
            .collect();

        Ok(json!({
            "matches": matches,
            "total": found.total,
            "indexingInProgress": found.indexing_in_progress,
            "indexed": found.indexed,
            "totalTools": found.total_tools,
        }))
    }

    async fn handle_run(&self, args: &Value, cancel: &CancellationToken) -> Result<Value> {
        let qualified = args
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidRequest("run requires a 'tool'".to_string()))?;
        let (provider, local) = split_qualified_name(qualified)?;
        let parameters = args.get("parameters").cloned().unwrap_or(json!({}));
        let skip_validation = args
            .get("skipValidation")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let deadline = args
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
            .min(MAX_CALL_TIMEOUT);

        let snapshot = self.aggregator.catalog().snapshot();
        let record = snapshot
            .get(qualified)
            .ok_or_else(|| GatewayError::ToolNotFound(qualified.to_string()))?;
        if !skip_validation {
            validate_params(&record.input_schema, &parameters)?;
        }

        match self
            .aggregator
            .call_tool(provider, local, parameters, deadline, Some(cancel))
            .await
        {
            Ok(content) => Ok(json!({"success": true, "content": translate_content(content)})),
            // Tool-level failures from the child come back in-band.
            Err(GatewayError::Child(payload)) => Ok(json!({"success": false, "error": payload})),
            Err(other) => Err(other),
        }
    }

    async fn handle_code(&self, args: &Value, cancel: &CancellationToken) -> Result<Value> {
        let sandbox = self
            .sandbox
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("sandbox not configured".to_string()))?;
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidRequest("code requires 'code'".to_string()))?;
        let timeout = args
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let outcome = sandbox.execute(code, timeout, Some(cancel)).await;
        let mut result = json!({
            "result": outcome.result.unwrap_or(Value::Null),
            "logs": outcome.logs,
        });
        if let Some(error) = outcome.error {
            result["error"] = Value::String(error);
        }
        Ok(result)
    }
}

/// Children usually answer with an MCP content-block list; unwrap a lone
/// text block to its string so `run("p1:echo") == "hi"` reads naturally.
/// Anything else passes through untouched.
fn translate_content(value: Value) -> Value {
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        if blocks.len() == 1 {
            if let Some(text) = blocks[0].get("text").and_then(Value::as_str) {
                return Value::String(text.to_string());
            }
        }
        return value["content"].clone();
    }
    value
}
