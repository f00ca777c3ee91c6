// src/client.rs
//
// One downstream client per provider. A dedicated connection task owns the
// transport: outbound frames are queued through a command channel (so they
// hit the wire in submission order), inbound frames are correlated back to
// callers through a pending map of oneshots keyed by request id. Responses
// may therefore interleave freely without head-of-line blocking.

use crate::catalog::{IngestedTool, ProviderListing};
use crate::codec::{
    decode_frame, encode_notification, encode_request, encode_response, IdSequence, RpcFrame,
    RpcResponse,
};
use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::transport::{self, Transport};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Handshaking,
    Ready,
    /// A transport error was seen on a call; the next call attempts a
    /// reconnect.
    Degraded,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_activity: Instant,
}

enum ConnCommand {
    Send(String),
    Close(oneshot::Sender<()>),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

struct Connection {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    ids: Arc<IdSequence>,
    pending: PendingMap,
    task: tokio::task::JoinHandle<()>,
}

pub struct DownstreamClient {
    provider: String,
    config: ServerConfig,
    protocol_version: String,
    status: Arc<Mutex<ConnectionStatus>>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    inflight: AtomicUsize,
    /// Version string advertised by the server's initialize result.
    server_revision: Mutex<Option<String>>,
}

impl DownstreamClient {
    pub fn new(provider: String, config: ServerConfig, protocol_version: String) -> Self {
        DownstreamClient {
            provider,
            config,
            protocol_version,
            status: Arc::new(Mutex::new(ConnectionStatus {
                state: ConnectionState::Pending,
                last_error: None,
                last_activity: Instant::now(),
            })),
            connection: tokio::sync::Mutex::new(None),
            inflight: AtomicUsize::new(0),
            server_revision: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().map(|s| s.state).unwrap_or(ConnectionState::Failed)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ConnectionStatus {
                state: ConnectionState::Failed,
                last_error: Some("status lock poisoned".to_string()),
                last_activity: Instant::now(),
            })
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut status) = self.status.lock() {
            status.state = state;
            status.last_activity = Instant::now();
        }
    }

    fn set_failed(&self, state: ConnectionState, error: String) {
        if let Ok(mut status) = self.status.lock() {
            status.state = state;
            status.last_error = Some(error);
            status.last_activity = Instant::now();
        }
    }

    /// Open the transport and perform the MCP handshake. On success the
    /// client is Ready; on any failure it is Failed and the gateway stays up.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Handshaking);
        let transport = match transport::connect(&self.provider, &self.config).await {
            Ok(t) => t,
            Err(e) => {
                self.set_failed(ConnectionState::Failed, e.to_string());
                return Err(e);
            }
        };
        self.attach(transport).await
    }

    /// Wire an already-open transport (tests inject fakes through here).
    pub async fn attach(&self, transport: Box<dyn Transport>) -> Result<()> {
        self.set_state(ConnectionState::Handshaking);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(connection_task(
            self.provider.clone(),
            transport,
            cmd_rx,
            pending.clone(),
            self.status.clone(),
        ));

        {
            let mut slot = self.connection.lock().await;
            if let Some(old) = slot.take() {
                old.task.abort();
            }
            *slot = Some(Connection {
                cmd_tx,
                ids: Arc::new(IdSequence::new()),
                pending,
                task,
            });
        }

        match self.handshake().await {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                info!(provider = %self.provider, "handshake complete");
                Ok(())
            }
            Err(e) => {
                warn!(provider = %self.provider, "handshake failed: {e}");
                self.teardown().await;
                self.set_failed(ConnectionState::Failed, e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": self.protocol_version,
            "capabilities": { "elicitation": {} },
            "clientInfo": {
                "name": "funnel-mcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self
            .request("initialize", Some(params), HANDSHAKE_TIMEOUT, None)
            .await?;

        if let Some(version) = result
            .pointer("/serverInfo/version")
            .and_then(Value::as_str)
        {
            if let Ok(mut revision) = self.server_revision.lock() {
                *revision = Some(version.to_string());
            }
        }

        self.notify("notifications/initialized", None).await
    }

    /// Issue `tools/list` and shape the answer for catalog ingest.
    pub async fn list_tools(&self) -> Result<ProviderListing> {
        let result = self
            .request("tools/list", Some(json!({})), LIST_TOOLS_TIMEOUT, None)
            .await?;
        let revision = self
            .server_revision
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "unversioned".to_string());

        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|tool| {
                        let name = tool.get("name")?.as_str()?.to_string();
                        Some(IngestedTool {
                            name,
                            title: tool
                                .get("title")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            description: tool
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            input_schema: tool
                                .get("inputSchema")
                                .cloned()
                                .unwrap_or_else(|| json!({"type": "object"})),
                            source_revision: revision.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProviderListing {
            provider: self.provider.clone(),
            source_identity: self.config.source_identity(),
            available: self.state() == ConnectionState::Ready,
            tools,
        })
    }

    /// The hot path: forward one tool call. Reconnects once when the client
    /// is Degraded; marks it Degraded when the transport fails underneath.
    pub async fn call_tool(
        &self,
        tool: &str,
        params: Value,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Degraded => {
                info!(provider = %self.provider, "degraded; attempting reconnect");
                self.connect().await?;
            }
            _ => return Err(GatewayError::ProviderUnavailable(self.provider.clone())),
        }

        self.inflight.fetch_add(1, Ordering::Relaxed);
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": tool, "arguments": params})),
                deadline,
                cancel,
            )
            .await;
        self.inflight.fetch_sub(1, Ordering::Relaxed);

        if let Err(GatewayError::ProviderShutdown(_)) = &result {
            self.set_failed(
                ConnectionState::Degraded,
                "transport failed during call".to_string(),
            );
        }
        result
    }

    async fn connection_handle(
        &self,
    ) -> Result<(mpsc::UnboundedSender<ConnCommand>, Arc<IdSequence>, PendingMap)> {
        let slot = self.connection.lock().await;
        match slot.as_ref() {
            Some(conn) => Ok((conn.cmd_tx.clone(), conn.ids.clone(), conn.pending.clone())),
            None => Err(GatewayError::ProviderUnavailable(self.provider.clone())),
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let (cmd_tx, ids, pending) = self.connection_handle().await?;
        let id = ids.next();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = pending.lock() {
            map.insert(id, tx);
        }

        let frame = encode_request(id, method, params);
        if cmd_tx.send(ConnCommand::Send(frame)).is_err() {
            if let Ok(mut map) = pending.lock() {
                map.remove(&id);
            }
            return Err(GatewayError::ProviderShutdown(self.provider.clone()));
        }

        let outcome = tokio::select! {
            response = rx => match response {
                Ok(response) => Ok(response),
                // The connection task dropped the pending map: peer is gone.
                Err(_) => Err(GatewayError::ProviderShutdown(self.provider.clone())),
            },
            _ = tokio::time::sleep(deadline) => Err(GatewayError::Timeout),
            _ = cancelled(cancel) => Err(GatewayError::Cancelled),
        };

        match outcome {
            Ok(response) => {
                if let Some(error) = response.error {
                    return Err(GatewayError::Child(json!({
                        "code": error.code,
                        "message": error.message,
                        "data": error.data,
                    })));
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Err(e) => {
                if let Ok(mut map) = pending.lock() {
                    map.remove(&id);
                }
                if matches!(e, GatewayError::Timeout | GatewayError::Cancelled) {
                    // Best effort: tell the child to stop working on it.
                    let note = encode_notification(
                        "notifications/cancelled",
                        Some(json!({"requestId": id})),
                    );
                    let _ = cmd_tx.send(ConnCommand::Send(note));
                }
                Err(e)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let (cmd_tx, _, _) = self.connection_handle().await?;
        let frame = encode_notification(method, params);
        cmd_tx
            .send(ConnCommand::Send(frame))
            .map_err(|_| GatewayError::ProviderShutdown(self.provider.clone()))
    }

    /// Explicit shutdown. In-flight calls fail with `ProviderShutdown` as
    /// the connection task drops the pending map.
    pub async fn close(&self) {
        self.teardown().await;
        self.set_state(ConnectionState::Closed);
    }

    async fn teardown(&self) {
        let conn = self.connection.lock().await.take();
        if let Some(conn) = conn {
            let (ack_tx, ack_rx) = oneshot::channel();
            if conn.cmd_tx.send(ConnCommand::Close(ack_tx)).is_ok() {
                let _ = tokio::time::timeout(Duration::from_secs(3), ack_rx).await;
            }
            conn.task.abort();
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// The per-connection task. Owns the transport exclusively; everything the
/// client does goes through the command channel, so outbound frames hit the
/// wire in submission order.
async fn connection_task(
    provider: String,
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    pending: PendingMap,
    status: Arc<Mutex<ConnectionStatus>>,
) {
    let mut malformed_frames = 0u32;
    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(ConnCommand::Send(frame)) => {
                    if let Err(e) = transport.send(&frame).await {
                        warn!(provider = %provider, "transport send failed: {e}");
                        mark(&status, ConnectionState::Degraded, Some(e.to_string()));
                        break;
                    }
                }
                Some(ConnCommand::Close(ack)) => {
                    let _ = transport.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    let _ = transport.shutdown().await;
                    break;
                }
            },
            inbound = transport.recv() => match inbound {
                Ok(Some(line)) => match decode_frame(&line) {
                    Ok(RpcFrame::Response(response)) => {
                        route_response(&provider, &pending, response);
                    }
                    Ok(RpcFrame::Notification { method, .. }) => {
                        debug!(provider = %provider, "notification from child: {method}");
                    }
                    Ok(RpcFrame::Request { id, method, .. }) => {
                        // We are the client side; server-initiated requests
                        // (sampling etc.) are not supported downstream.
                        debug!(provider = %provider, "unsupported child request: {method}");
                        let reply = encode_response(&RpcResponse::method_not_found(id));
                        let _ = transport.send(&reply).await;
                    }
                    Err(e) => {
                        malformed_frames += 1;
                        if malformed_frames == 1 {
                            warn!(provider = %provider, "malformed frame from child: {e}");
                            mark(&status, ConnectionState::Degraded, Some(e.to_string()));
                        } else {
                            warn!(provider = %provider, "second malformed frame; closing");
                            let _ = transport.shutdown().await;
                            break;
                        }
                    }
                },
                Ok(None) => {
                    debug!(provider = %provider, "child closed its stream");
                    mark(&status, ConnectionState::Degraded, Some("peer closed".to_string()));
                    break;
                }
                Err(e) => {
                    warn!(provider = %provider, "transport recv failed: {e}");
                    mark(&status, ConnectionState::Degraded, Some(e.to_string()));
                    break;
                }
            },
        }
    }
    // Dropping the map wakes every waiter with ProviderShutdown.
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
}

fn mark(status: &Arc<Mutex<ConnectionStatus>>, state: ConnectionState, error: Option<String>) {
    if let Ok(mut s) = status.lock() {
        // Never resurrect a closed connection's status.
        if s.state != ConnectionState::Closed {
            s.state = state;
            if error.is_some() {
                s.last_error = error;
            }
            s.last_activity = Instant::now();
        }
    }
}

fn route_response(provider: &str, pending: &PendingMap, response: RpcResponse) {
    let Some(id) = response.id.as_u64() else {
        debug!(provider = %provider, "response with non-integer id ignored");
        return;
    };
    let waiter = pending.lock().ok().and_then(|mut map| map.remove(&id));
    match waiter {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => debug!(provider = %provider, "response for unknown id {id} (late or cancelled)"),
    }
}
