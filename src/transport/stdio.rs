// src/transport/stdio.rs

use crate::codec::FrameReader;
use crate::command::validate_command;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::Transport;

/// Grace period between each step of the termination ladder:
/// stdin close, SIGTERM, SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Child-process transport: the provider runs as a subprocess, frames move
/// over its stdin/stdout, and stderr is teed into our logs at debug.
#[derive(Debug)]
pub struct StdioTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: FrameReader<ChildStdout>,
}

impl StdioTransport {
    pub fn spawn(
        provider: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        validate_command(command, args)?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env) // merged over the inherited host environment
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::ProviderUnavailable(format!("{provider}: spawn failed: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = provider.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %name, "child stderr: {line}");
                }
            });
        }

        Ok(StdioTransport {
            child,
            stdin: Some(stdin),
            reader: FrameReader::new(stdout),
        })
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        if let Some(pid) = self.child.id() {
            // Safety: plain kill(2) on a pid we own.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) {}

    async fn wait_with_grace(&mut self) -> bool {
        matches!(
            tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, frame: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| GatewayError::Internal("child stdin already closed".to_string()))?;
        stdin.write_all(frame.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        self.reader.next_line().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        // Closing stdin is the polite request to exit.
        drop(self.stdin.take());
        if self.wait_with_grace().await {
            return Ok(());
        }

        self.send_sigterm();
        if self.wait_with_grace().await {
            return Ok(());
        }

        warn!("child ignored SIGTERM; killing");
        self.child.start_kill().ok();
        let _ = self.child.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_rejects_disallowed_command() {
        let err = StdioTransport::spawn("p", "bash", &["-c".into(), "true".into()], &HashMap::new());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_runtime_is_unavailable() {
        // `uvx` is on the allow-list but almost certainly not installed at
        // this path; spawn failure must map to ProviderUnavailable.
        let result = StdioTransport::spawn(
            "p",
            "/nonexistent/path/to/uvx",
            &[],
            &HashMap::new(),
        );
        match result {
            Err(GatewayError::ProviderUnavailable(msg)) => assert!(msg.contains("spawn failed")),
            other => panic!("expected ProviderUnavailable, got {other:?}"),
        }
    }
}
