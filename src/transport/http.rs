// src/transport/http.rs
//
// HTTP provider transport: outbound frames are POSTed to the server's
// message endpoint, inbound frames arrive on a server-sent-events stream
// opened once per session. The SSE side announces the per-session message
// endpoint as its first event; until then we fall back to the base URL.

use crate::config::AuthConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::Transport;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Keepalive pings are expected well inside this window.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

type ByteStream = BoxStream<'static, reqwest::Result<bytes::Bytes>>;

pub struct HttpTransport {
    client: reqwest::Client,
    post_url: Url,
    auth_header: Option<String>,
    stream: Option<ByteStream>,
    parser: SseParser,
    /// Frames that arrived while waiting for the endpoint event.
    pending: Vec<String>,
}

impl HttpTransport {
    pub async fn connect(url: &str, auth: Option<&AuthConfig>) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid provider url: {e}")))?;
        let auth_header = auth_header_value(auth)?;

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;

        let mut request = client
            .get(base.clone())
            .header("Accept", "text/event-stream");
        if let Some(value) = &auth_header {
            request = request.header("Authorization", value.clone());
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::ProviderUnavailable(format!("sse connect to {base} failed: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(GatewayError::ProviderUnavailable(format!(
                "sse connect to {base} returned {}",
                response.status()
            )));
        }

        let mut transport = HttpTransport {
            client,
            post_url: base.clone(),
            auth_header,
            stream: Some(response.bytes_stream().boxed()),
            parser: SseParser::default(),
            pending: Vec::new(),
        };

        // The endpoint event names the per-session POST target. A server
        // that never sends one just gets its frames POSTed to the base URL.
        match tokio::time::timeout(CONNECT_TIMEOUT, transport.read_endpoint(&base)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => debug!("no endpoint event from {base}; posting to base url"),
        }

        Ok(transport)
    }

    async fn read_endpoint(&mut self, base: &Url) -> Result<()> {
        loop {
            match self.next_event().await? {
                Some(event) if event.name == "endpoint" => {
                    self.post_url = base.join(event.data.trim()).map_err(|e| {
                        GatewayError::Parse(format!("bad endpoint event '{}': {e}", event.data))
                    })?;
                    debug!("session message endpoint: {}", self.post_url);
                    return Ok(());
                }
                Some(event) if event.name == "message" => {
                    self.pending.push(event.data);
                }
                Some(_) => {} // ping or other event kinds
                None => {
                    return Err(GatewayError::ProviderUnavailable(
                        "sse stream closed during connect".to_string(),
                    ))
                }
            }
        }
    }

    async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some(event) = self.parser.next_event() {
                return Ok(Some(event));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(chunk))) => self.parser.push(&chunk),
                Ok(Some(Err(e))) => {
                    self.stream = None;
                    return Err(GatewayError::ProviderUnavailable(format!(
                        "sse stream error: {e}"
                    )));
                }
                Ok(None) => {
                    self.stream = None;
                    return Ok(None);
                }
                Err(_) => {
                    self.stream = None;
                    return Err(GatewayError::Timeout);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, frame: &str) -> Result<()> {
        let mut request = self
            .client
            .post(self.post_url.clone())
            .header("Content-Type", "application/json")
            .body(frame.to_string());
        if let Some(value) = &self.auth_header {
            request = request.header("Authorization", value.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("post failed: {e}")))?;
        if !response.status().is_success() {
            return Err(GatewayError::ProviderUnavailable(format!(
                "post returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.remove(0)));
        }
        loop {
            match self.next_event().await? {
                Some(event) if event.name == "message" => return Ok(Some(event.data)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

fn auth_header_value(auth: Option<&AuthConfig>) -> Result<Option<String>> {
    match auth {
        None | Some(AuthConfig::None) => Ok(None),
        Some(AuthConfig::Bearer { token }) => Ok(Some(format!("Bearer {token}"))),
        Some(AuthConfig::Oauth { token, .. }) => match token {
            // The token itself is obtained by an external OAuth provider;
            // by the time the core connects it must already be present.
            Some(token) => Ok(Some(format!("Bearer {token}"))),
            None => Err(GatewayError::InvalidRequest(
                "oauth provider has no token; run the credential flow first".to_string(),
            )),
        },
    }
}

#[derive(Debug, PartialEq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental SSE parser: fed raw bytes, yields complete events. Events
/// are blank-line delimited; `data:` lines accumulate, `event:` renames,
/// comment lines (leading `:`) are keepalives and ignored.
#[derive(Default)]
struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let boundary = find_blank_line(&self.buf)?;
            let block: Vec<u8> = self.buf.drain(..boundary.end).collect();
            let text = String::from_utf8_lossy(&block[..boundary.start]).into_owned();

            let mut name = "message".to_string();
            let mut data: Vec<&str> = Vec::new();
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    name = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push(rest.strip_prefix(' ').unwrap_or(rest));
                } else if line.starts_with(':') {
                    // keepalive comment
                }
            }
            if data.is_empty() && name == "message" {
                continue; // comment-only block
            }
            return Some(SseEvent {
                name,
                data: data.join("\n"),
            });
        }
    }
}

struct Boundary {
    start: usize,
    end: usize,
}

/// Find the first blank-line delimiter (\n\n or \r\n\r\n), returning the
/// byte range of the block body and the end of the delimiter.
fn find_blank_line(buf: &[u8]) -> Option<Boundary> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some(Boundary {
                start: i,
                end: i + 2,
            });
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some(Boundary {
                start: i,
                end: i + 4,
            });
        }
        i += 1;
    }
    None
}
