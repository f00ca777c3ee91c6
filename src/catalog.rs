// src/catalog.rs
//
// The authoritative in-memory tool catalog. Snapshots are immutable values;
// a rebuild swaps the whole snapshot and publishes it over a watch channel,
// so readers are wait-free and always see a consistent set.

use crate::error::{GatewayError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Separator between provider and local tool name in a qualified name.
pub const NAME_SEPARATOR: char = ':';

/// One tool as known to the gateway.
#[derive(Debug, Clone)]
pub struct ToolRecord {
    /// `"<provider>:<localName>"`, unique within a snapshot.
    pub qualified_name: String,
    pub provider: String,
    pub local_name: String,
    pub title: Option<String>,
    pub description: String,
    pub input_schema: Value,
    /// The child's advertised version, or a hash of its listing.
    pub source_revision: String,
    /// False while the owning provider is Failed or Degraded. The tool
    /// stays findable but `run` will refuse it.
    pub available: bool,
}

impl ToolRecord {
    /// Hash of the description alone, for embedding-cache reuse checks.
    pub fn description_hash(&self) -> String {
        short_hash(self.description.as_bytes())
    }

    /// Hash of the input schema, canonicalized through serde_json.
    pub fn schema_hash(&self) -> String {
        short_hash(self.input_schema.to_string().as_bytes())
    }

    /// The text the semantic index embeds for this tool.
    pub fn embedding_text(&self) -> String {
        match &self.title {
            Some(title) => format!("{} {} {}", self.local_name, title, self.description),
            None => format!("{} {}", self.local_name, self.description),
        }
    }
}

fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

/// Split a qualified name at the first separator.
pub fn split_qualified_name(name: &str) -> Result<(&str, &str)> {
    match name.split_once(NAME_SEPARATOR) {
        Some((provider, local)) if !provider.is_empty() && !local.is_empty() => {
            Ok((provider, local))
        }
        _ => Err(GatewayError::ToolNotFound(format!(
            "'{name}' is not a qualified tool name (expected provider{NAME_SEPARATOR}tool)"
        ))),
    }
}

/// Tools of one provider as ingested from its `tools/list` answer.
#[derive(Debug, Clone)]
pub struct ProviderListing {
    pub provider: String,
    /// Command line or URL; folded into the fingerprint.
    pub source_identity: String,
    pub available: bool,
    pub tools: Vec<IngestedTool>,
}

#[derive(Debug, Clone)]
pub struct IngestedTool {
    pub name: String,
    pub title: Option<String>,
    pub description: String,
    pub input_schema: Value,
    pub source_revision: String,
}

/// An immutable catalog snapshot plus its fingerprint.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    tools: Arc<BTreeMap<String, ToolRecord>>,
    fingerprint: String,
}

impl CatalogSnapshot {
    /// Build a snapshot from per-provider listings. Duplicate local names
    /// within one provider are rejected (first wins, the rest are dropped
    /// with a warning); a qualified name therefore resolves to exactly one
    /// provider.
    pub fn build(listings: &[ProviderListing]) -> CatalogSnapshot {
        let mut tools = BTreeMap::new();
        let mut hasher = Sha256::new();

        let mut sorted: Vec<&ProviderListing> = listings.iter().collect();
        sorted.sort_by(|a, b| a.provider.cmp(&b.provider));

        for listing in sorted {
            hasher.update(listing.provider.as_bytes());
            hasher.update([0]);
            hasher.update(listing.source_identity.as_bytes());
            hasher.update([0]);

            let mut seen = HashSet::new();
            let mut provider_tools: Vec<&IngestedTool> = listing.tools.iter().collect();
            provider_tools.sort_by(|a, b| a.name.cmp(&b.name));

            for tool in provider_tools {
                if !seen.insert(tool.name.clone()) {
                    warn!(
                        provider = %listing.provider,
                        tool = %tool.name,
                        "duplicate tool name in provider listing; keeping the first"
                    );
                    continue;
                }
                let schema_text = tool.input_schema.to_string();
                hasher.update(tool.name.as_bytes());
                hasher.update([0]);
                hasher.update(tool.description.as_bytes());
                hasher.update([0]);
                hasher.update(schema_text.as_bytes());
                hasher.update([0]);

                let qualified_name =
                    format!("{}{}{}", listing.provider, NAME_SEPARATOR, tool.name);
                tools.insert(
                    qualified_name.clone(),
                    ToolRecord {
                        qualified_name,
                        provider: listing.provider.clone(),
                        local_name: tool.name.clone(),
                        title: tool.title.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.input_schema.clone(),
                        source_revision: tool.source_revision.clone(),
                        available: listing.available,
                    },
                );
            }
        }

        CatalogSnapshot {
            tools: Arc::new(tools),
            fingerprint: hex::encode(hasher.finalize()),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn get(&self, qualified_name: &str) -> Option<&ToolRecord> {
        self.tools.get(qualified_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolRecord> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.tools.contains_key(qualified_name)
    }
}

/// Qualified-name sets describing one rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

/// Owner of the current snapshot. Listeners (the semantic index, the
/// gateway's tools/list cache) subscribe to the watch channel.
pub struct Catalog {
    tx: watch::Sender<CatalogSnapshot>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CatalogSnapshot::default());
        Catalog { tx }
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.tx.subscribe()
    }

    /// Install a rebuilt snapshot and report what changed.
    pub fn install(&self, next: CatalogSnapshot) -> CatalogChange {
        let previous = self.snapshot();
        let mut added = Vec::new();
        let mut kept = Vec::new();
        for name in next.tools.keys() {
            if previous.contains(name) {
                kept.push(name.clone());
            } else {
                added.push(name.clone());
            }
        }
        let removed: Vec<String> = previous
            .tools
            .keys()
            .filter(|name| !next.contains(name))
            .cloned()
            .collect();

        let _ = self.tx.send(next);
        CatalogChange {
            added,
            removed,
            kept,
        }
    }
}

/// Light structural validation of call parameters against a tool's input
/// schema: required fields must be present, and declared primitive types
/// must match. Anything deeper is the child's business.
pub fn validate_params(schema: &Value, params: &Value) -> Result<()> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(Value::as_str) == Some("object") && !params.is_object() {
        return Err(GatewayError::SchemaValidation(
            "parameters must be an object".to_string(),
        ));
    }

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if params.get(field).is_none() {
                return Err(GatewayError::SchemaValidation(format!(
                    "missing required field '{field}'"
                )));
            }
        }
    }

    if let Some(properties) = obj.get("properties").and_then(Value::as_object) {
        for (field, spec) in properties {
            let Some(value) = params.get(field) else {
                continue;
            };
            let Some(expected) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                "null" => value.is_null(),
                _ => true,
            };
            if !ok {
                return Err(GatewayError::SchemaValidation(format!(
                    "field '{field}' should be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}
