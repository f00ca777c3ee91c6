// src/confirm.rs
//
// Side-channel to the human behind the host. Mutating management tools,
// the egress policy and interactive internal tools all funnel their consent
// questions through here. Elicitation over MCP is preferred; an OS dialog
// is the fallback; with neither, questions are answered "decline".

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How long a native dialog may sit unanswered before we report `Pending`.
const NATIVE_DIALOG_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Accept(Option<Value>),
    Decline,
    Cancel,
    /// The question is still on screen (native dialog timeout). Callers
    /// should tell the user to answer it and retry.
    Pending,
}

impl Confirmation {
    pub fn is_accept(&self) -> bool {
        matches!(self, Confirmation::Accept(_))
    }
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn confirm(&self, message: &str, schema: Value) -> Result<Confirmation>;
}

/// Channel of last resort: declines everything, loudly.
pub struct DenyAllChannel;

#[async_trait]
impl ConfirmationChannel for DenyAllChannel {
    async fn confirm(&self, message: &str, _schema: Value) -> Result<Confirmation> {
        debug!("no consent channel available; declining: {message}");
        Ok(Confirmation::Decline)
    }
}

/// OS-native modal dialog. Used only when the host did not advertise the
/// elicitation capability. Free-form schema input is out of reach here, so
/// an accepted dialog carries no content.
pub struct NativeDialogChannel;

impl NativeDialogChannel {
    fn command(message: &str) -> Option<tokio::process::Command> {
        #[cfg(target_os = "linux")]
        {
            let mut cmd = tokio::process::Command::new("zenity");
            cmd.arg("--question").arg("--text").arg(message);
            Some(cmd)
        }
        #[cfg(target_os = "macos")]
        {
            let mut cmd = tokio::process::Command::new("osascript");
            cmd.arg("-e").arg(format!(
                "display dialog {:?} buttons {{\"Deny\", \"Allow\"}} default button \"Deny\"",
                message
            ));
            Some(cmd)
        }
        #[cfg(target_os = "windows")]
        {
            let mut cmd = tokio::process::Command::new("powershell");
            cmd.arg("-NoProfile").arg("-Command").arg(format!(
                "Add-Type -AssemblyName PresentationFramework; \
                 if ([System.Windows.MessageBox]::Show({:?}, 'funnel-mcp', 'YesNo') -eq 'Yes') {{ exit 0 }} else {{ exit 1 }}",
                message
            ));
            Some(cmd)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            let _ = message;
            None
        }
    }
}

#[async_trait]
impl ConfirmationChannel for NativeDialogChannel {
    async fn confirm(&self, message: &str, _schema: Value) -> Result<Confirmation> {
        let Some(mut cmd) = Self::command(message) else {
            return Ok(Confirmation::Decline);
        };
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("native dialog unavailable: {e}");
                return Ok(Confirmation::Decline);
            }
        };

        match tokio::time::timeout(NATIVE_DIALOG_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(Confirmation::Accept(None)),
            Ok(Ok(_)) => Ok(Confirmation::Decline),
            Ok(Err(e)) => {
                warn!("native dialog failed: {e}");
                Ok(Confirmation::Decline)
            }
            Err(_) => {
                // Leave the dialog up; the user may still answer it.
                Ok(Confirmation::Pending)
            }
        }
    }
}

/// The channel everything holds a handle to. Starts out in fallback mode;
/// once the inbound `initialize` reveals an elicitation-capable host, the
/// server swaps the preferred channel in. Answers are session-scoped;
/// nothing here persists.
pub struct ConfirmationRouter {
    preferred: RwLock<Option<Arc<dyn ConfirmationChannel>>>,
    fallback: Arc<dyn ConfirmationChannel>,
}

impl ConfirmationRouter {
    pub fn new(fallback: Arc<dyn ConfirmationChannel>) -> Self {
        ConfirmationRouter {
            preferred: RwLock::new(None),
            fallback,
        }
    }

    pub fn with_native_fallback() -> Self {
        Self::new(Arc::new(NativeDialogChannel))
    }

    pub async fn set_preferred(&self, channel: Arc<dyn ConfirmationChannel>) {
        *self.preferred.write().await = Some(channel);
    }

    /// Whether an elicitation-capable channel is wired up.
    pub async fn has_preferred(&self) -> bool {
        self.preferred.read().await.is_some()
    }

    pub async fn confirm(&self, message: &str, schema: Value) -> Result<Confirmation> {
        let preferred = self.preferred.read().await.clone();
        match preferred {
            Some(channel) => channel.confirm(message, schema).await,
            None => self.fallback.confirm(message, schema).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ScriptedChannel(Confirmation);

    #[async_trait]
    impl ConfirmationChannel for ScriptedChannel {
        async fn confirm(&self, _message: &str, _schema: Value) -> Result<Confirmation> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_deny_all_declines() {
        let channel = DenyAllChannel;
        let outcome = channel.confirm("allow?", json!({})).await.unwrap();
        assert_eq!(outcome, Confirmation::Decline);
        assert!(!outcome.is_accept());
    }

    #[tokio::test]
    async fn test_router_uses_fallback_until_preferred_is_set() {
        let router = ConfirmationRouter::new(Arc::new(DenyAllChannel));
        assert!(!router.has_preferred().await);
        assert_eq!(
            router.confirm("q", json!({})).await.unwrap(),
            Confirmation::Decline
        );

        router
            .set_preferred(Arc::new(ScriptedChannel(Confirmation::Accept(Some(
                json!({"ok": true}),
            )))))
            .await;
        assert!(router.has_preferred().await);
        match router.confirm("q", json!({})).await.unwrap() {
            Confirmation::Accept(Some(content)) => assert_eq!(content["ok"], true),
            other => panic!("expected accept, got {other:?}"),
        }
    }
}
