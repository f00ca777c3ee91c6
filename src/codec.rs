// src/codec.rs
//
// Newline-delimited JSON-RPC 2.0 framing. Both sides of the gateway speak
// this: the inbound host connection and every downstream child. One frame
// per line; requests carry a monotonic integer id, notifications omit it,
// responses echo it. Matching is solely by id.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// Default cap on a single frame. A frame exactly at the cap is accepted,
/// one byte over is rejected with `ParseError`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// JSON-RPC 2.0 error object as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&GatewayError> for RpcError {
    fn from(err: &GatewayError) -> Self {
        RpcError {
            code: err.code(),
            message: err.to_string(),
            data: err.data(),
        }
    }
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: String, data: Option<Value>) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message,
                data,
            }),
        }
    }

    pub fn from_gateway_error(id: Value, err: &GatewayError) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError::from(err)),
        }
    }

    pub fn method_not_found(id: Value) -> Self {
        Self::error(id, -32601, "Method not found".to_string(), None)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum RpcFrame {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response(RpcResponse),
}

// Permissive superset: which frame kind a line is depends on which fields
// are present, so decode once and classify.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Decode one line into a frame. Lines that are not syntactically valid
/// JSON objects, or that are neither request, notification nor response,
/// fail with `ParseError`.
pub fn decode_frame(line: &str) -> Result<RpcFrame> {
    let raw: RawFrame = serde_json::from_str(line)
        .map_err(|e| GatewayError::Parse(format!("malformed frame: {e}")))?;

    match (raw.method, raw.id) {
        (Some(method), Some(id)) => Ok(RpcFrame::Request {
            id,
            method,
            params: raw.params,
        }),
        (Some(method), None) => Ok(RpcFrame::Notification {
            method,
            params: raw.params,
        }),
        (None, Some(id)) => {
            if raw.result.is_none() && raw.error.is_none() {
                return Err(GatewayError::Parse(
                    "response frame carries neither result nor error".to_string(),
                ));
            }
            Ok(RpcFrame::Response(RpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result: raw.result,
                error: raw.error,
            }))
        }
        (None, None) => Err(GatewayError::Parse(
            "frame carries neither method nor id".to_string(),
        )),
    }
}

/// Encode an outbound request. The caller appends the newline when writing.
pub fn encode_request(id: u64, method: &str, params: Option<Value>) -> String {
    let mut obj = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
    });
    if let Some(p) = params {
        obj["params"] = p;
    }
    obj.to_string()
}

pub fn encode_notification(method: &str, params: Option<Value>) -> String {
    let mut obj = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(p) = params {
        obj["params"] = p;
    }
    obj.to_string()
}

pub fn encode_response(response: &RpcResponse) -> String {
    // RpcResponse contains only serializable fields; this cannot fail.
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"encode failure"}}"#
            .to_string()
    })
}

/// Monotonic request-id allocator, one per peer.
#[derive(Debug, Default)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    pub fn new() -> Self {
        IdSequence(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Buffered line reader with a frame-size cap. Incomplete trailing data is
/// carried across reads; an oversize line is drained so the connection can
/// resynchronize on the next newline instead of dying.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame: usize,
    // Set after an oversize frame: discard bytes until the next newline.
    skipping: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame(inner, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(inner: R, max_frame: usize) -> Self {
        FrameReader {
            inner,
            buf: Vec::new(),
            max_frame,
            skipping: false,
            eof: false,
        }
    }

    /// Next non-empty line, or `None` at clean EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if self.skipping {
                if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                    self.buf.drain(..=pos);
                    self.skipping = false;
                    continue;
                }
                self.buf.clear();
            } else if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop(); // trailing \n
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                if line.len() > self.max_frame {
                    return Err(GatewayError::Parse(format!(
                        "frame of {} bytes exceeds cap of {}",
                        line.len(),
                        self.max_frame
                    )));
                }
                let text = String::from_utf8(line)
                    .map_err(|_| GatewayError::Parse("frame is not valid UTF-8".to_string()))?;
                return Ok(Some(text));
            } else if self.buf.len() > self.max_frame {
                // The unfinished line is already over the cap; drop what we
                // have and keep discarding until the next newline.
                let seen = self.buf.len();
                self.buf.clear();
                self.skipping = true;
                return Err(GatewayError::Parse(format!(
                    "frame exceeds cap of {} bytes (got {} and counting)",
                    self.max_frame, seen
                )));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Final line without a trailing newline.
                let mut line = std::mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8(line)
                    .map_err(|_| GatewayError::Parse("frame is not valid UTF-8".to_string()))?;
                return Ok(Some(text));
            }

            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                if self.skipping {
                    self.skipping = false;
                    self.buf.clear();
                }
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_request() {
        let frame = decode_frame(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        match frame {
            RpcFrame::Request { id, method, params } => {
                assert_eq!(id, json!(1));
                assert_eq!(method, "tools/list");
                assert!(params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let frame =
            decode_frame(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(frame, RpcFrame::Notification { .. }));
    }

    #[test]
    fn test_decode_response_roundtrip() {
        let response = RpcResponse::success(json!(7), json!({"ok": true}));
        let line = encode_response(&response);
        match decode_frame(&line).unwrap() {
            RpcFrame::Response(r) => {
                assert_eq!(r.id, json!(7));
                assert_eq!(r.result, Some(json!({"ok": true})));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame("{}").is_err());
        // Response without result or error is malformed.
        assert!(decode_frame(r#"{"jsonrpc":"2.0","id":3}"#).is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let response = RpcResponse::method_not_found(json!(2));
        assert_eq!(response.error.as_ref().unwrap().code, -32601);
        assert!(response.result.is_none());
    }

    #[test]
    fn test_id_sequence_is_monotonic() {
        let ids = IdSequence::new();
        let a = ids.next();
        let b = ids.next();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_frame_reader_buffers_partial_lines() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx);

        use tokio::io::AsyncWriteExt;
        tx.write_all(b"{\"jsonrpc\":\"2.0\",").await.unwrap();
        tx.write_all(b"\"method\":\"ping\"}\n{\"method\":\"x\"}\n")
            .await
            .unwrap();
        drop(tx);

        let first = reader.next_line().await.unwrap().unwrap();
        assert!(first.contains("ping"));
        let second = reader.next_line().await.unwrap().unwrap();
        assert!(second.contains("\"x\""));
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_reader_cap_boundary() {
        // A line exactly at the cap passes, one byte over fails.
        let cap = 32;
        let at_cap = "a".repeat(cap);
        let over = "b".repeat(cap + 1);
        let input = format!("{at_cap}\n{over}\nafter\n");

        let mut reader = FrameReader::with_max_frame(std::io::Cursor::new(input), cap);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), at_cap);
        assert!(matches!(
            reader.next_line().await,
            Err(GatewayError::Parse(_))
        ));
        // The connection resynchronizes on the next line.
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn test_frame_reader_final_line_without_newline() {
        let mut reader = FrameReader::new(std::io::Cursor::new("tail".to_string()));
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "tail");
        assert!(reader.next_line().await.unwrap().is_none());
    }
}
