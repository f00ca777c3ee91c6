// src/transport/mod.rs
//
// Byte-stream transports beneath the downstream clients. A transport moves
// whole frames (newline-delimited JSON-RPC, see codec) and knows nothing
// about their contents. Exactly one task owns a transport at a time, which
// is what makes `send` atomic: frames from one peer can never interleave.

mod http;
mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

use crate::config::ServerConfig;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send {
    /// Write one frame. The transport appends the line terminator.
    async fn send(&mut self, frame: &str) -> Result<()>;

    /// Next inbound frame, or `None` when the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Tear the connection down, gracefully where the variant supports it.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Open the transport a provider config describes.
pub async fn connect(provider: &str, config: &ServerConfig) -> Result<Box<dyn Transport>> {
    match config {
        ServerConfig::Stdio { command, args, env } => Ok(Box::new(
            StdioTransport::spawn(provider, command, args, env)?,
        )),
        ServerConfig::Http { url, auth } => {
            Ok(Box::new(HttpTransport::connect(url, auth.as_ref()).await?))
        }
    }
}
