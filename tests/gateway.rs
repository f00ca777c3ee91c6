// tests/gateway.rs
//
// End-to-end scenarios: a host drives the gateway over in-memory pipes
// exactly as a real MCP client would over stdio. Internal providers stand
// in for child processes so the scenarios run hermetically.

use async_trait::async_trait;
use funnel_mcp::aggregator::MCPAggregator;
use funnel_mcp::confirm::{ConfirmationRouter, DenyAllChannel};
use funnel_mcp::error::{GatewayError, Result};
use funnel_mcp::internal::{ToolDescriptor, ToolOutcome, ToolProvider};
use funnel_mcp::{GatewayServer, LexicalEmbedder, SemanticIndex, SurfaceMode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// An in-process provider scripted per test: tool name -> behavior.
struct ScriptedProvider {
    name: String,
    tools: Vec<(String, String)>,
    behavior: fn(&str, Value) -> Result<Value>,
}

#[async_trait]
impl ToolProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self
            .tools
            .iter()
            .map(|(name, description)| ToolDescriptor {
                name: name.clone(),
                title: None,
                description: description.clone(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}}
                }),
            })
            .collect())
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<ToolOutcome> {
        if tool == "stall" {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        (self.behavior)(tool, args).map(ToolOutcome::Done)
    }
}

fn echo_provider(name: &str) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider {
        name: name.to_string(),
        tools: vec![
            (
                "echo".to_string(),
                "echo a string back, repeating the input text".to_string(),
            ),
            ("stall".to_string(), "never answers in time".to_string()),
        ],
        behavior: |tool, args| match tool {
            "echo" => Ok(json!({"content": [{"type": "text", "text": args["text"].as_str().unwrap_or("")}]})),
            "stall" => Ok(Value::Null),
            other => Err(GatewayError::ToolNotFound(other.to_string())),
        },
    })
}

/// The host side of the wire: writes frames, reads responses by id.
struct Host {
    writer: DuplexStream,
    reader: BufReader<DuplexStream>,
    next_id: u64,
}

impl Host {
    async fn connect(mode: SurfaceMode, providers: Vec<Arc<ScriptedProvider>>) -> Host {
        let aggregator = Arc::new(MCPAggregator::new(
            "2024-11-05".to_string(),
            Arc::new(ConfirmationRouter::new(Arc::new(DenyAllChannel))),
        ));
        for provider in providers {
            aggregator.register_internal(provider).await.unwrap();
        }
        let index = Arc::new(SemanticIndex::new(
            Arc::new(LexicalEmbedder::default()),
            None,
        ));
        index.rebuild(&aggregator.get_tools().await).await.unwrap();

        let server = GatewayServer::new(
            aggregator,
            index,
            mode,
            "2024-11-05".to_string(),
        );

        let (host_out, server_in) = tokio::io::duplex(256 * 1024);
        let (server_out, host_in) = tokio::io::duplex(256 * 1024);
        tokio::spawn(server.run_with_io(server_in, server_out));

        Host {
            writer: host_out,
            reader: BufReader::new(host_in),
            next_id: 1,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn notify(&mut self, method: &str, params: Value) {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.send_line(&frame.to_string()).await;
    }

    /// Send a request and return its id without waiting.
    async fn send_request(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send_line(&frame.to_string()).await;
        id
    }

    /// Read frames until the response for `id` arrives (responses may
    /// interleave arbitrarily).
    async fn wait_response(&mut self, id: u64) -> Value {
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(
                Duration::from_secs(10),
                self.reader.read_line(&mut line),
            )
            .await
            .expect("timed out waiting for response")
            .unwrap();
            assert!(n > 0, "server closed the stream while waiting for {id}");
            let frame: Value = serde_json::from_str(line.trim()).unwrap();
            if frame.get("id") == Some(&json!(id)) {
                return frame;
            }
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.send_request(method, params).await;
        self.wait_response(id).await
    }

    async fn initialize(&mut self) -> Value {
        let response = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "test-host", "version": "0"}
                }),
            )
            .await;
        self.notify("notifications/initialized", json!({})).await;
        response
    }

    /// Call a synthesized tool and return its structured content.
    async fn call(&mut self, tool: &str, arguments: Value) -> Value {
        let response = self
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await;
        assert!(
            response.get("error").is_none(),
            "unexpected error: {response}"
        );
        response["result"]["structuredContent"].clone()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_discovery_and_run_fidelity() {
    let mut host = Host::connect(SurfaceMode::FindRun, vec![echo_provider("p1")]).await;

    let init = host.initialize().await;
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(init["result"]["serverInfo"]["name"], "funnel-mcp");

    // The surface is synthesized, not the raw child tools.
    let listed = host.request("tools/list", json!({})).await;
    let names: Vec<&str> = listed["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["find", "run"]);

    // Scenario 1: discovery by description.
    let found = host
        .call("find", json!({"description": "repeat text", "limit": 3}))
        .await;
    assert_eq!(found["matches"][0]["qualifiedName"], "p1:echo");
    assert!(found["matches"][0]["score"].as_f64().unwrap() > 0.0);
    assert_eq!(found["indexingInProgress"], false);

    // Scenario 2: run fidelity.
    let ran = host
        .call("run", json!({"tool": "p1:echo", "parameters": {"text": "hi"}}))
        .await;
    assert_eq!(ran["success"], true);
    assert_eq!(ran["content"], "hi");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_before_initialize_are_rejected() {
    let mut host = Host::connect(SurfaceMode::FindRun, vec![echo_provider("p1")]).await;
    let response = host.request("tools/list", json!({})).await;
    assert_eq!(response["error"]["code"], -32002);

    // And the connection still works after initializing properly.
    host.initialize().await;
    let listed = host.request("tools/list", json!({})).await;
    assert!(listed.get("error").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_do_not_kill_the_connection() {
    let mut host = Host::connect(SurfaceMode::FindRun, vec![echo_provider("p1")]).await;
    host.initialize().await;

    host.send_line("this is not json").await;
    // The parse error comes back with a null id.
    let mut line = String::new();
    host.reader.read_line(&mut line).await.unwrap();
    let frame: Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(frame["error"]["code"], -32700);
    assert_eq!(frame["id"], Value::Null);

    // Subsequent traffic is unaffected.
    let listed = host.request("tools/list", json!({})).await;
    assert!(listed.get("error").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_isolation_between_two_providers() {
    // Provider "b" works; provider "a" exists in the catalog but has no
    // live connection (its handle was never registered), which is how a
    // crashed child presents after its listing was ingested.
    let mut host = Host::connect(
        SurfaceMode::FindRun,
        vec![echo_provider("a"), echo_provider("b")],
    )
    .await;
    host.initialize().await;

    // Both are findable...
    let found = host
        .call("find", json!({"description": "echo a string", "limit": 10}))
        .await;
    let names: Vec<&str> = found["matches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["qualifiedName"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"a:echo"));
    assert!(names.contains(&"b:echo"));

    // ...and calls to "b" succeed regardless of anything about "a".
    let ran = host
        .call("run", json!({"tool": "b:echo", "parameters": {"text": "pong"}}))
        .await;
    assert_eq!(ran["success"], true);
    assert_eq!(ran["content"], "pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_provider_is_a_clean_error() {
    let mut host = Host::connect(SurfaceMode::FindRun, vec![echo_provider("p1")]).await;
    host.initialize().await;

    let response = host
        .request(
            "tools/call",
            json!({"name": "run", "arguments": {"tool": "nosuch:thing", "parameters": {}}}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32010); // ToolNotFound
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_notification_aborts_a_call() {
    let mut host = Host::connect(SurfaceMode::FindRun, vec![echo_provider("p1")]).await;
    host.initialize().await;

    let id = host
        .send_request(
            "tools/call",
            json!({"name": "run", "arguments": {"tool": "p1:stall", "parameters": {}, "timeoutMs": 60000}}),
        )
        .await;
    host.notify("notifications/cancelled", json!({"requestId": id}))
        .await;

    let response = host.wait_response(id).await;
    assert_eq!(response["error"]["code"], -32016); // Cancelled
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_timeout_returns_timeout_promptly() {
    let mut host = Host::connect(SurfaceMode::FindRun, vec![echo_provider("p1")]).await;
    host.initialize().await;

    let started = Instant::now();
    let response = host
        .request(
            "tools/call",
            json!({"name": "run", "arguments": {"tool": "p1:stall", "parameters": {}, "timeoutMs": 1}}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32015); // Timeout
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn code_mode_runs_scripts_with_tool_bindings() {
    let mut host = Host::connect(SurfaceMode::FindCode, vec![echo_provider("p1")]).await;
    host.initialize().await;

    let listed = host.request("tools/list", json!({})).await;
    let names: Vec<&str> = listed["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["find", "code"]);

    let outcome = host
        .call(
            "code",
            json!({"code": r#"print("calling"); p1::echo(#{text: "from-script"})"#}),
        )
        .await;
    assert_eq!(outcome["logs"], json!(["calling"]));
    assert!(outcome.get("error").is_none());
    // The child's single text block is the tool result the script sees.
    assert_eq!(
        outcome["result"]["content"][0]["text"],
        "from-script"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sandbox_timeout_is_bounded() {
    let mut host = Host::connect(SurfaceMode::CodeOnly, vec![echo_provider("p1")]).await;
    host.initialize().await;

    let started = Instant::now();
    let outcome = host
        .call("code", json!({"code": "while true {}", "timeout": 200}))
        .await;
    assert!(outcome["error"].as_str().unwrap().contains("timeout"));
    assert!(started.elapsed() < Duration::from_millis(350));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn egress_denied_without_elicitation_while_other_traffic_flows() {
    let mut host = Host::connect(SurfaceMode::FindCode, vec![echo_provider("p1")]).await;
    host.initialize().await;

    // Kick off the network-touching script first...
    let code_id = host
        .send_request(
            "tools/call",
            json!({"name": "code", "arguments": {"code": r#"fetch("http://192.168.1.1/")"#}}),
        )
        .await;
    // ...then a find in parallel; it must complete normally.
    let find_id = host
        .send_request(
            "tools/call",
            json!({"name": "find", "arguments": {"description": "echo a string"}}),
        )
        .await;

    let find_response = host.wait_response(find_id).await;
    assert!(find_response.get("error").is_none());

    let code_response = host.wait_response(code_id).await;
    let error = code_response["result"]["structuredContent"]["error"]
        .as_str()
        .unwrap();
    assert!(error.contains("NetworkBlocked"), "got: {error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sandbox_state_does_not_leak_between_code_calls() {
    let mut host = Host::connect(SurfaceMode::CodeOnly, vec![echo_provider("p1")]).await;
    host.initialize().await;

    let first = host
        .call("code", json!({"code": "let marker = 7; marker"}))
        .await;
    assert_eq!(first["result"], 7);

    let second = host.call("code", json!({"code": "marker"})).await;
    assert!(second.get("error").is_some());
    assert_eq!(second["result"], Value::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_with_provider_filter() {
    let mut host = Host::connect(
        SurfaceMode::FindRun,
        vec![echo_provider("alpha"), echo_provider("beta")],
    )
    .await;
    host.initialize().await;

    let found = host
        .call(
            "find",
            json!({
                "description": "echo a string",
                "filters": {"providers": ["beta"]}
            }),
        )
        .await;
    for m in found["matches"].as_array().unwrap() {
        assert_eq!(m["provider"], "beta");
    }
    assert!(!found["matches"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_is_reflected_in_the_catalog() {
    // Exercised at the aggregator level: reload with an empty config set
    // closes nothing (internal providers are not part of the remote diff)
    // and the catalog stays intact.
    let aggregator = Arc::new(MCPAggregator::new(
        "2024-11-05".to_string(),
        Arc::new(ConfirmationRouter::new(Arc::new(DenyAllChannel))),
    ));
    aggregator
        .register_internal(echo_provider("keep"))
        .await
        .unwrap();

    let change = aggregator.reload(&HashMap::new()).await;
    assert!(change.removed.is_empty());
    assert!(aggregator.get_tools().await.contains("keep:echo"));
}
