// src/sandbox/bindings.rs
//
// What a script can reach: one module per provider whose functions proxy
// tool calls back into the gateway, the `act` convenience router, and the
// egress-brokered `fetch`. All host functions run on the sandbox's blocking
// thread and re-enter the async runtime through the captured handle.

use crate::catalog::CatalogSnapshot;
use crate::egress::EgressPolicy;
use crate::error::GatewayError;
use crate::index::tokenize;
use rhai::{Dynamic, Engine, EvalAltResult, Module, Position};
use serde_json::{Map as JsonMap, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

use super::ToolInvoker;

/// Minimum slice of time a host function gets even right at the deadline,
/// so its error is "timed out" rather than a zero-length call.
const MIN_CALL_BUDGET: Duration = Duration::from_millis(10);

pub(super) fn throw(err: GatewayError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(format!("{}: {}", err.kind(), err)),
        Position::NONE,
    ))
}

/// Make a name usable as a script identifier: `search-code` becomes
/// `search_code`, a leading digit gets an underscore prefix.
pub(super) fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn dynamic_to_value(value: Dynamic) -> Result<Value, Box<EvalAltResult>> {
    rhai::serde::from_dynamic::<Value>(&value)
}

fn value_to_dynamic(value: &Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(MIN_CALL_BUDGET)
}

/// Register one module per provider. Each tool becomes a function taking an
/// object map (and a zero-argument overload for parameterless calls):
/// `github::list_repos(#{org: "x"})`. Resolution happens against the
/// catalog at call time, so scripts may mention providers they never touch.
pub(super) fn bind_catalog(
    engine: &mut Engine,
    snapshot: &CatalogSnapshot,
    invoker: &Arc<dyn ToolInvoker>,
    handle: &Handle,
    deadline: Instant,
) {
    let providers: HashSet<String> = snapshot.iter().map(|t| t.provider.clone()).collect();

    for provider in providers {
        let mut module = Module::new();
        for tool in snapshot.iter().filter(|t| t.provider == provider) {
            let fname = sanitize_identifier(&tool.local_name);

            let call = {
                let invoker = invoker.clone();
                let handle = handle.clone();
                let provider = provider.clone();
                let tool = tool.local_name.clone();
                move |params: Value| -> Result<Dynamic, Box<EvalAltResult>> {
                    let result = handle.block_on(invoker.call_tool(
                        &provider,
                        &tool,
                        params,
                        remaining(deadline),
                    ));
                    match result {
                        Ok(value) => value_to_dynamic(&value),
                        Err(e) => Err(throw(e)),
                    }
                }
            };

            {
                let call = call.clone();
                module.set_native_fn(fname.as_str(), move |params: rhai::Map| {
                    call(dynamic_to_value(Dynamic::from(params))?)
                });
            }
            module.set_native_fn(fname.as_str(), move || call(Value::Object(JsonMap::new())));
        }
        engine.register_static_module(sanitize_identifier(&provider), module.into());
    }
}

/// `act(intent)` / `act(intent, context)` — find the best tool for the
/// intent, align the supplied context with its schema, invoke it. (`do`,
/// the name the original exposes, is a reserved word in the script
/// language.) It performs no I/O of its own beyond the routed tool call.
pub(super) fn bind_act(
    engine: &mut Engine,
    snapshot: &CatalogSnapshot,
    invoker: &Arc<dyn ToolInvoker>,
    handle: &Handle,
    deadline: Instant,
) {
    let act = {
        let snapshot = snapshot.clone();
        let invoker = invoker.clone();
        let handle = handle.clone();
        move |intent: &str, context: Value| -> Result<Dynamic, Box<EvalAltResult>> {
            let found = handle
                .block_on(invoker.find(intent, 5))
                .map_err(throw)?;
            let best = found
                .matches
                .iter()
                .find(|m| m.available)
                .ok_or_else(|| {
                    throw(GatewayError::ToolNotFound(format!(
                        "no available tool matches '{intent}'"
                    )))
                })?;

            let schema = snapshot
                .get(&best.qualified_name)
                .map(|tool| tool.input_schema.clone())
                .unwrap_or(Value::Null);
            let params = align_params(&context, &schema);

            let result = handle.block_on(invoker.call_tool(
                &best.provider,
                &best.qualified_name
                    .split_once(':')
                    .map(|(_, local)| local.to_string())
                    .unwrap_or_else(|| best.qualified_name.clone()),
                params,
                remaining(deadline),
            ));
            match result {
                Ok(value) => value_to_dynamic(&value),
                Err(e) => Err(throw(e)),
            }
        }
    };

    {
        let act = act.clone();
        engine.register_fn(
            "act",
            move |intent: &str, context: rhai::Map| -> Result<Dynamic, Box<EvalAltResult>> {
                act(intent, dynamic_to_value(Dynamic::from(context))?)
            },
        );
    }
    engine.register_fn(
        "act",
        move |intent: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            act(intent, Value::Object(JsonMap::new()))
        },
    );
}

/// `fetch(url)` — brokered HTTP GET. The egress policy decides (possibly
/// asking the host) before any connection is opened.
pub(super) fn bind_fetch(
    engine: &mut Engine,
    egress: &Arc<EgressPolicy>,
    handle: &Handle,
    deadline: Instant,
) {
    let egress = egress.clone();
    let handle = handle.clone();
    engine.register_fn(
        "fetch",
        move |url: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let url = url.to_string();
            let egress = egress.clone();
            let body = handle.block_on(async move {
                egress.check_url(&url).await?;
                let client = reqwest::Client::builder()
                    .timeout(remaining(deadline))
                    .build()
                    .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| GatewayError::Sandbox(format!("fetch failed: {e}")))?;
                response
                    .text()
                    .await
                    .map_err(|e| GatewayError::Sandbox(format!("fetch body failed: {e}")))
            });
            match body {
                Ok(text) => Ok(Dynamic::from(text)),
                Err(e) => Err(throw(e)),
            }
        },
    );
}

/// Semantic alias groups for parameter alignment. A context key from one
/// group satisfies a schema property from the same group.
const ALIAS_GROUPS: &[&[&str]] = &[
    &["text", "message", "content", "body", "value", "input", "data"],
    &["query", "search", "q", "term", "keyword"],
    &["path", "file", "filename", "filepath", "dir", "directory"],
    &["url", "uri", "link", "address", "endpoint"],
    &["id", "identifier", "key"],
    &["name", "title", "label"],
    &["limit", "count", "max", "top", "n"],
];

fn alias_group(term: &str) -> Option<usize> {
    ALIAS_GROUPS
        .iter()
        .position(|group| group.contains(&term))
}

/// Line up caller-supplied context with a tool's input schema: exact
/// property names first, then the alias table, then token overlap between
/// names. Keys the schema does not mention are dropped; a non-object
/// context fills the single required property if there is exactly one.
pub(super) fn align_params(context: &Value, schema: &Value) -> Value {
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let Some(context_map) = context.as_object() else {
        if context.is_null() {
            return Value::Object(JsonMap::new());
        }
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if required.len() == 1 {
            let mut out = JsonMap::new();
            out.insert(required[0].to_string(), context.clone());
            return Value::Object(out);
        }
        return context.clone();
    };

    if properties.is_empty() {
        return context.clone();
    }

    let mut out = JsonMap::new();
    for (property, _spec) in &properties {
        // 1. Exact name.
        if let Some(value) = context_map.get(property) {
            out.insert(property.clone(), value.clone());
            continue;
        }
        // 2. Alias table.
        if let Some(group) = alias_group(property.as_str()) {
            if let Some((_, value)) = context_map
                .iter()
                .find(|(key, _)| alias_group(key.as_str()) == Some(group))
            {
                out.insert(property.clone(), value.clone());
                continue;
            }
        }
        // 3. Token overlap between names.
        let property_terms = tokenize(property);
        let best = context_map
            .iter()
            .map(|(key, value)| {
                let overlap = tokenize(key)
                    .iter()
                    .filter(|t| property_terms.contains(t))
                    .count();
                (overlap, key, value)
            })
            .filter(|(overlap, _, _)| *overlap > 0)
            .max_by_key(|(overlap, _, _)| *overlap);
        if let Some((_, _, value)) = best {
            out.insert(property.clone(), value.clone());
        }
    }
    Value::Object(out)
}
