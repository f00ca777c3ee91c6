// src/internal.rs
//
// In-process tool providers. They register with the aggregator under a
// provider name and present the exact contract a downstream server does,
// so nothing about find/run/code can tell them apart from a child process.

use crate::catalog::{IngestedTool, ProviderListing};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Descriptor of one internal tool. These are written by hand or generated
/// at build time into a `.schema` JSON file; either way they are plain data,
/// no runtime reflection.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object"})
}

/// Parse a pre-generated descriptor file (a JSON array of descriptors).
pub fn load_descriptors(text: &str) -> Result<Vec<ToolDescriptor>> {
    serde_json::from_str(text)
        .map_err(|e| GatewayError::InvalidRequest(format!("bad descriptor file: {e}")))
}

/// Outcome of an internal tool call. Interactive tools are state machines:
/// instead of a final value they may hand back an input request; the
/// gateway routes it over the confirmation channel and resumes the call
/// with the host's answer.
#[derive(Debug)]
pub enum ToolOutcome {
    Done(Value),
    InputRequest {
        /// Opaque continuation handle, passed back to `resume`.
        token: u64,
        message: String,
        schema: Value,
    },
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    async fn call_tool(&self, tool: &str, args: Value) -> Result<ToolOutcome>;

    /// Continue an interactive call with the host's answer. Providers that
    /// never return `InputRequest` keep the default.
    async fn resume(&self, _token: u64, _input: Value) -> Result<ToolOutcome> {
        Err(GatewayError::Internal(
            "tool did not request input".to_string(),
        ))
    }
}

/// Shape an internal provider's descriptors for catalog ingest.
pub async fn listing_for(provider: &dyn ToolProvider) -> Result<ProviderListing> {
    let tools = provider
        .list_tools()
        .await?
        .into_iter()
        .map(|d| IngestedTool {
            name: d.name,
            title: d.title,
            description: d.description,
            input_schema: d.input_schema,
            source_revision: "builtin".to_string(),
        })
        .collect();
    Ok(ProviderListing {
        provider: provider.name().to_string(),
        source_identity: format!("internal:{}", provider.name()),
        available: true,
        tools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PingProvider;

    #[async_trait]
    impl ToolProvider for PingProvider {
        fn name(&self) -> &str {
            "util"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            load_descriptors(
                r#"[{"name": "ping", "description": "reply with pong",
                     "inputSchema": {"type": "object"}}]"#,
            )
        }

        async fn call_tool(&self, tool: &str, _args: Value) -> Result<ToolOutcome> {
            match tool {
                "ping" => Ok(ToolOutcome::Done(json!("pong"))),
                other => Err(GatewayError::ToolNotFound(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_listing_shapes_descriptors() {
        let listing = listing_for(&PingProvider).await.unwrap();
        assert_eq!(listing.provider, "util");
        assert_eq!(listing.source_identity, "internal:util");
        assert_eq!(listing.tools.len(), 1);
        assert_eq!(listing.tools[0].name, "ping");
        assert_eq!(listing.tools[0].source_revision, "builtin");
    }

    #[test]
    fn test_load_descriptors_defaults_schema() {
        let descriptors = load_descriptors(r#"[{"name": "bare"}]"#).unwrap();
        assert_eq!(descriptors[0].input_schema, json!({"type": "object"}));
        assert!(load_descriptors("not json").is_err());
    }

    #[tokio::test]
    async fn test_default_resume_rejects() {
        let provider = PingProvider;
        assert!(provider.resume(1, json!({})).await.is_err());
    }
}
