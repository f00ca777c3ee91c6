// src/error.rs
use serde_json::Value;
use thiserror::Error;

/// Gateway error taxonomy. Every variant maps to a stable JSON-RPC error
/// code so hosts can branch on failures without string matching.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server not initialized")]
    NotInitialized,

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Provider '{0}' is not available right now; try again later")]
    ProviderUnavailable(String),

    #[error("Provider '{0}' has too many calls in flight")]
    ProviderBusy(String),

    #[error("Provider '{0}' shut down while the call was in flight")]
    ProviderShutdown(String),

    #[error("Deadline elapsed")]
    Timeout,

    #[error("Cancelled by caller")]
    Cancelled,

    /// Error payload returned by a downstream server, forwarded verbatim.
    #[error("Downstream error: {0}")]
    Child(Value),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Network access to {destination} blocked: {reason}")]
    NetworkBlocked { destination: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable JSON-RPC error code. Standard codes for the standard three;
    /// gateway-specific kinds live in the implementation-defined -32000 range.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) | Self::Json(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::NotInitialized => -32002,
            Self::ToolNotFound(_) => -32010,
            Self::SchemaValidation(_) => -32011,
            Self::ProviderUnavailable(_) => -32012,
            Self::ProviderBusy(_) => -32013,
            Self::ProviderShutdown(_) => -32014,
            Self::Timeout => -32015,
            Self::Cancelled => -32016,
            Self::Child(_) => -32017,
            Self::Sandbox(_) => -32018,
            Self::NetworkBlocked { .. } => -32019,
            Self::Io(_) | Self::Internal(_) => -32603,
        }
    }

    /// Short machine-readable kind, attached to error payloads so scripts
    /// and hosts can branch without parsing the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) | Self::Json(_) => "ParseError",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::NotInitialized => "NotInitialized",
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::SchemaValidation(_) => "SchemaValidation",
            Self::ProviderUnavailable(_) => "ProviderUnavailable",
            Self::ProviderBusy(_) => "ProviderBusy",
            Self::ProviderShutdown(_) => "ProviderShutdown",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Child(_) => "ChildError",
            Self::Sandbox(_) => "SandboxError",
            Self::NetworkBlocked { .. } => "NetworkBlocked",
            Self::Io(_) | Self::Internal(_) => "Internal",
        }
    }

    /// Structured data attached to the wire error object, where a variant
    /// carries more than its message.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::Child(payload) => Some(payload.clone()),
            Self::NetworkBlocked {
                destination,
                reason,
            } => Some(serde_json::json!({
                "destination": destination,
                "reason": reason,
            })),
            _ => None,
        }
    }
}
